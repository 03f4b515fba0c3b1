//! Local table of unresolved operations.
//!
//! Only the node that issued an operation holds an entry for it, and an
//! entry is the only thing that can resolve the caller's future. Map events
//! observed for keys without an entry never complete anything on this node.

use crate::core::error::{OperationError, OperationResult};
use crate::store::record::ResourceKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Kind of operation a pending entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// An install.
    Install,
    /// A removal.
    Remove,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// Handle to an install or remove that completes when the device answers.
///
/// Resolves with `Err(OperationError::Shutdown)` if the store goes away
/// first. There is no built-in timeout; race it against a timer.
#[derive(Debug)]
pub struct PendingOperation {
    key: ResourceKey,
    rx: oneshot::Receiver<OperationResult>,
}

impl PendingOperation {
    /// An operation that is already complete.
    pub fn ready(key: ResourceKey, result: OperationResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { key, rx }
    }

    /// Key the operation targets.
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Non-blocking check for the outcome.
    pub fn try_result(&mut self) -> Option<OperationResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(OperationError::Shutdown)),
        }
    }
}

impl Future for PendingOperation {
    type Output = OperationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(OperationError::Shutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct PendingEntry {
    kind: OperationKind,
    seq: u64,
    tx: oneshot::Sender<OperationResult>,
}

/// Ticket returned on registration, used to roll back only our own entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    kind: OperationKind,
    seq: u64,
}

/// Pending operations keyed by resource.
pub struct PendingTable {
    entries: Mutex<HashMap<ResourceKey, PendingEntry>>,
    next_seq: AtomicU64,
}

impl PendingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Register an operation, superseding any earlier one on the same key.
    pub fn register(&self, key: ResourceKey, kind: OperationKind) -> (Ticket, PendingOperation) {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .entries
            .lock()
            .insert(key.clone(), PendingEntry { kind, seq, tx });

        if let Some(previous) = previous {
            tracing::debug!(key = %key, kind = %previous.kind, "pending operation superseded");
            let _ = previous.tx.send(Err(OperationError::Superseded));
        }

        (Ticket { kind, seq }, PendingOperation { key, rx })
    }

    /// Take our entry out of the table, if it is still ours.
    ///
    /// Returns the entry so the caller can complete the future itself.
    fn take_ticket(&self, key: &ResourceKey, ticket: Ticket) -> Option<PendingEntry> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.seq == ticket.seq => entries.remove(key),
            _ => None,
        }
    }

    /// Resolve our entry with the given result, if it is still ours.
    pub fn fail_ticket(&self, key: &ResourceKey, ticket: Ticket, result: OperationResult) -> bool {
        match self.take_ticket(key, ticket) {
            Some(entry) => {
                tracing::debug!(key = %key, kind = %ticket.kind, "pending operation resolved early");
                let _ = entry.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Resolve the entry for a key if it is of the given kind.
    pub fn complete(&self, key: &ResourceKey, kind: OperationKind, result: OperationResult) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) if entry.kind == kind => entries.remove(key),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Resolve the entry for a key whatever its kind, mapping the result by kind.
    pub fn complete_any(
        &self,
        key: &ResourceKey,
        result: impl FnOnce(OperationKind) -> OperationResult,
    ) -> Option<OperationKind> {
        let entry = self.entries.lock().remove(key)?;
        let kind = entry.kind;
        let _ = entry.tx.send(result(kind));
        Some(kind)
    }

    /// Kind of the entry registered for a key.
    pub fn kind_of(&self, key: &ResourceKey) -> Option<OperationKind> {
        self.entries.lock().get(key).map(|e| e.kind)
    }

    /// Number of unresolved local operations.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Resolve every entry with the given error.
    pub fn fail_all(&self, error: OperationError) -> usize {
        let drained: Vec<PendingEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::DeviceId;

    fn key(id: u32) -> ResourceKey {
        ResourceKey::new(DeviceId::new("of:1"), id)
    }

    #[test]
    fn second_registration_supersedes_first() {
        let table = PendingTable::new();
        let (_, mut first) = table.register(key(1), OperationKind::Install);
        let (_, mut second) = table.register(key(1), OperationKind::Remove);

        assert_eq!(first.try_result(), Some(Err(OperationError::Superseded)));
        assert_eq!(second.try_result(), None);
        assert_eq!(table.kind_of(&key(1)), Some(OperationKind::Remove));
    }

    #[test]
    fn complete_requires_matching_kind() {
        let table = PendingTable::new();
        let (_, mut op) = table.register(key(1), OperationKind::Remove);

        assert!(!table.complete(&key(1), OperationKind::Install, Ok(())));
        assert!(table.complete(&key(1), OperationKind::Remove, Ok(())));
        assert_eq!(op.try_result(), Some(Ok(())));
        assert!(table.is_empty());
    }

    #[test]
    fn stale_ticket_does_not_touch_newer_entry() {
        let table = PendingTable::new();
        let (old, _first) = table.register(key(1), OperationKind::Install);
        let (_, mut second) = table.register(key(1), OperationKind::Install);

        assert!(!table.fail_ticket(&key(1), old, Err(OperationError::Purged)));
        assert_eq!(second.try_result(), None);
    }

    #[tokio::test]
    async fn dropped_table_resolves_shutdown() {
        let table = PendingTable::new();
        let (_, op) = table.register(key(1), OperationKind::Install);
        drop(table);
        assert_eq!(op.await, Err(OperationError::Shutdown));
    }

    #[tokio::test]
    async fn fail_all_resolves_every_future() {
        let table = PendingTable::new();
        let (_, a) = table.register(key(1), OperationKind::Install);
        let (_, b) = table.register(key(2), OperationKind::Remove);

        assert_eq!(table.fail_all(OperationError::Shutdown), 2);
        assert_eq!(a.await, Err(OperationError::Shutdown));
        assert_eq!(b.await, Err(OperationError::Shutdown));
    }
}
