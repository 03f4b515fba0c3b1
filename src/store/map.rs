//! Replicated state map abstraction.
//!
//! The store never talks to a consensus implementation directly. Anything
//! that offers per-key atomic read-modify-write, a monotonic version token and
//! cluster-wide change notifications can back it through [`ReplicatedMap`].
//!
//! # Delivery guarantees expected from implementations
//!
//! - Events reach every node's listeners, including the writer's.
//! - Delivery is at-least-once and ordered per key; different keys carry no
//!   relative ordering.
//! - Listeners may write back to the map from inside `event`; an
//!   implementation must not deadlock or recurse unboundedly when they do.

use crate::core::error::StoreResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A value paired with the version token of the write that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<V> {
    /// The stored value.
    pub value: V,
    /// Monotonic version of the write.
    pub version: u64,
}

impl<V> Versioned<V> {
    /// Create a versioned value.
    pub fn new(value: V, version: u64) -> Self {
        Self { value, version }
    }

    /// Map the inner value, keeping the version.
    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Versioned<U> {
        Versioned {
            value: f(self.value),
            version: self.version,
        }
    }
}

/// Decision returned by a compute closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update<V> {
    /// Leave the entry untouched; no write and no event.
    Keep,
    /// Store a new value.
    Set(V),
    /// Delete the entry.
    Remove,
}

/// Type of a map change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapEventType {
    /// A key was created.
    Insert,
    /// An existing key changed value.
    Update,
    /// A key was deleted.
    Remove,
}

/// A map change notification.
#[derive(Debug, Clone)]
pub struct MapEvent<K, V> {
    /// Name of the map that changed.
    pub map_name: String,
    /// Type of change.
    pub event_type: MapEventType,
    /// Affected key.
    pub key: K,
    /// Value after the change (absent for Remove).
    pub new_value: Option<Versioned<V>>,
    /// Value before the change (absent for Insert).
    pub old_value: Option<Versioned<V>>,
}

impl<K, V> MapEvent<K, V> {
    /// The value this event is about: the new value, or the removed one.
    pub fn value(&self) -> Option<&Versioned<V>> {
        match self.event_type {
            MapEventType::Remove => self.old_value.as_ref(),
            MapEventType::Insert | MapEventType::Update => self.new_value.as_ref(),
        }
    }
}

/// Receiver of map change notifications.
pub trait MapListener<K, V>: Send + Sync {
    /// Handle a change. Must not block.
    fn event(&self, event: &MapEvent<K, V>);
}

/// Handle identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Cluster-replicated key to value map.
///
/// Every operation may fail with a storage failure when the underlying
/// replicas lose quorum. Callers must not retry internally.
pub trait ReplicatedMap<K, V>: Send + Sync {
    /// Name of the map, unique within the cluster.
    fn name(&self) -> &str;

    /// Read the current value.
    fn get(&self, key: &K) -> StoreResult<Option<Versioned<V>>>;

    /// Unconditionally store a value, returning the previous one.
    fn put(&self, key: K, value: V) -> StoreResult<Option<Versioned<V>>>;

    /// Atomically read-modify-write a key, present or not.
    ///
    /// Returns the value held after the call (unchanged on [`Update::Keep`],
    /// `None` if the key is absent afterwards). The closure may be invoked
    /// more than once by implementations that retry on version conflicts.
    fn compute(
        &self,
        key: &K,
        f: &mut dyn FnMut(Option<&V>) -> Update<V>,
    ) -> StoreResult<Option<Versioned<V>>>;

    /// Atomically read-modify-write a key only if it is present.
    fn compute_if_present(
        &self,
        key: &K,
        f: &mut dyn FnMut(&V) -> Update<V>,
    ) -> StoreResult<Option<Versioned<V>>> {
        self.compute(key, &mut |current| match current {
            Some(value) => f(value),
            None => Update::Keep,
        })
    }

    /// Delete a key if present, returning the removed value.
    fn remove(&self, key: &K) -> StoreResult<Option<Versioned<V>>>;

    /// Snapshot of every entry.
    fn entries(&self) -> StoreResult<Vec<(K, Versioned<V>)>>;

    /// Register a change listener on this node.
    fn add_listener(&self, listener: Arc<dyn MapListener<K, V>>) -> ListenerId;

    /// Deregister a listener. Returns false if it was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_event_exposes_old_value() {
        let event: MapEvent<u32, &str> = MapEvent {
            map_name: "m".to_string(),
            event_type: MapEventType::Remove,
            key: 1,
            new_value: None,
            old_value: Some(Versioned::new("gone", 3)),
        };
        assert_eq!(event.value().map(|v| v.value), Some("gone"));
    }

    #[test]
    fn versioned_map_keeps_version() {
        let v = Versioned::new(2u32, 9).map(|x| x * 10);
        assert_eq!(v, Versioned::new(20, 9));
    }
}
