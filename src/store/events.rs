//! Typed lifecycle events and their local fan-out.

use crate::store::map::ListenerId;
use crate::store::record::StateRecord;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Type of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEventType {
    /// A record entered PENDING_ADD; the device master should program it.
    AddRequested,
    /// A record entered PENDING_REMOVE; the device master should remove it.
    RemoveRequested,
    /// The origin observed the device acknowledge an install.
    Added,
    /// The origin consumed the removal tombstone, or the record was purged.
    Removed,
    /// An installed meter reported zero referencing flows.
    ReferenceCountZero,
}

impl fmt::Display for LifecycleEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddRequested => write!(f, "ADD_REQ"),
            Self::RemoveRequested => write!(f, "REM_REQ"),
            Self::Added => write!(f, "ADDED"),
            Self::Removed => write!(f, "REMOVED"),
            Self::ReferenceCountZero => write!(f, "REFERENCE_COUNT_ZERO"),
        }
    }
}

/// A lifecycle event carrying the record it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Type of event.
    pub event_type: LifecycleEventType,
    /// Record as of the event.
    pub record: StateRecord,
}

impl LifecycleEvent {
    /// Create an event.
    pub fn new(event_type: LifecycleEventType, record: StateRecord) -> Self {
        Self { event_type, record }
    }
}

/// Receiver of lifecycle events.
pub trait LifecycleListener: Send + Sync {
    /// Handle an event. Must not block.
    fn event(&self, event: &LifecycleEvent);
}

/// Local registry of lifecycle listeners.
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn LifecycleListener>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener.
    pub fn add(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Deregister a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Deliver an event to every listener.
    ///
    /// The listener list is snapshotted first so handlers may register or
    /// deregister listeners.
    pub fn post(&self, event: LifecycleEvent) {
        tracing::trace!(
            event = %event.event_type,
            key = %event.record.key,
            "posting lifecycle event"
        );
        let listeners: Vec<Arc<dyn LifecycleListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.event(&event);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Check if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deregister every listener.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::mastership::NodeId;
    use crate::store::record::{AppId, DeviceId, MeterUnit, ResourceDescriptor, ResourceKey};
    use parking_lot::Mutex;

    struct Count(Mutex<Vec<LifecycleEventType>>);

    impl LifecycleListener for Count {
        fn event(&self, event: &LifecycleEvent) {
            self.0.lock().push(event.event_type);
        }
    }

    fn record() -> StateRecord {
        let device = DeviceId::new("of:1");
        StateRecord::pending_add(
            ResourceKey::new(device.clone(), 1),
            ResourceDescriptor::new(device, AppId::new("app"), MeterUnit::KbPerSec, 1),
            NodeId::new("n1"),
        )
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let bus = EventBus::new();
        let seen = Arc::new(Count(Mutex::new(Vec::new())));
        let id = bus.add(seen.clone());

        bus.post(LifecycleEvent::new(LifecycleEventType::AddRequested, record()));
        assert!(bus.remove(id));
        assert!(!bus.remove(id));
        bus.post(LifecycleEvent::new(LifecycleEventType::Added, record()));

        assert_eq!(*seen.0.lock(), vec![LifecycleEventType::AddRequested]);
        assert!(bus.is_empty());
    }

    #[test]
    fn event_type_display() {
        assert_eq!(LifecycleEventType::AddRequested.to_string(), "ADD_REQ");
        assert_eq!(
            LifecycleEventType::ReferenceCountZero.to_string(),
            "REFERENCE_COUNT_ZERO"
        );
    }
}
