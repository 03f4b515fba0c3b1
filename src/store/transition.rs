//! Lifecycle transition table.
//!
//! Every legal state change of a [`StateRecord`] is one row of a table keyed
//! by `(Phase, Trigger)`. The coordinator looks the pair up before writing;
//! a missing row is an ignored transition, logged by the caller and never
//! applied.
//!
//! [`StateRecord`]: crate::store::record::StateRecord

use crate::store::record::{LifecycleState, StateRecord};
use std::collections::HashMap;
use std::fmt;

/// Record state as seen by the table, with failed pending states split out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No record for the key.
    Absent,
    /// Install in flight.
    PendingAdd,
    /// Install rejected by the device; record kept with its reason.
    PendingAddFailed,
    /// Installed.
    Added,
    /// Removal in flight.
    PendingRemove,
    /// Removal rejected by the device.
    PendingRemoveFailed,
    /// Tombstone awaiting consumption by its origin.
    Removed,
}

impl Phase {
    /// Classify an optional record.
    pub fn of(record: Option<&StateRecord>) -> Self {
        let Some(record) = record else {
            return Self::Absent;
        };
        match (record.state, record.is_failed()) {
            (LifecycleState::PendingAdd, false) => Self::PendingAdd,
            (LifecycleState::PendingAdd, true) => Self::PendingAddFailed,
            (LifecycleState::Added, _) => Self::Added,
            (LifecycleState::PendingRemove, false) => Self::PendingRemove,
            (LifecycleState::PendingRemove, true) => Self::PendingRemoveFailed,
            (LifecycleState::Removed, _) => Self::Removed,
        }
    }

    /// Stored lifecycle state for this phase, if a record exists.
    pub fn state(&self) -> Option<LifecycleState> {
        match self {
            Self::Absent => None,
            Self::PendingAdd | Self::PendingAddFailed => Some(LifecycleState::PendingAdd),
            Self::Added => Some(LifecycleState::Added),
            Self::PendingRemove | Self::PendingRemoveFailed => {
                Some(LifecycleState::PendingRemove)
            }
            Self::Removed => Some(LifecycleState::Removed),
        }
    }

    /// Check if this phase carries a failure reason.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::PendingAddFailed | Self::PendingRemoveFailed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "ABSENT"),
            Self::PendingAdd => write!(f, "PENDING_ADD"),
            Self::PendingAddFailed => write!(f, "PENDING_ADD(failed)"),
            Self::Added => write!(f, "ADDED"),
            Self::PendingRemove => write!(f, "PENDING_REMOVE"),
            Self::PendingRemoveFailed => write!(f, "PENDING_REMOVE(failed)"),
            Self::Removed => write!(f, "REMOVED"),
        }
    }
}

/// Event that may move a record between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Local install request.
    Install,
    /// Local remove request.
    Remove,
    /// Device confirmed the in-flight operation.
    DeviceAck,
    /// Device rejected the in-flight operation.
    DeviceReject,
    /// Device reported counters for the meter.
    DeviceStats,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Remove => write!(f, "remove"),
            Self::DeviceAck => write!(f, "device_ack"),
            Self::DeviceReject => write!(f, "device_reject"),
            Self::DeviceStats => write!(f, "device_stats"),
        }
    }
}

/// Lookup table of legal transitions.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    edges: HashMap<(Phase, Trigger), Phase>,
}

impl TransitionTable {
    fn empty() -> Self {
        Self {
            edges: HashMap::new(),
        }
    }

    /// The meter lifecycle.
    pub fn standard() -> Self {
        use Phase::*;
        use Trigger::*;

        Self::empty()
            .with(Absent, Install, PendingAdd)
            .with(PendingAddFailed, Install, PendingAdd)
            .with(PendingAdd, DeviceAck, Added)
            .with(PendingAdd, DeviceReject, PendingAddFailed)
            .with(PendingAdd, DeviceStats, Added)
            .with(PendingAddFailed, DeviceStats, Added)
            .with(Added, DeviceStats, Added)
            .with(PendingAdd, Remove, PendingRemove)
            .with(PendingAddFailed, Remove, PendingRemove)
            .with(Added, Remove, PendingRemove)
            .with(PendingRemove, Remove, PendingRemove)
            .with(PendingRemoveFailed, Remove, PendingRemove)
            .with(PendingRemove, DeviceAck, Removed)
            .with(PendingRemoveFailed, DeviceAck, Removed)
            .with(PendingRemove, DeviceReject, PendingRemoveFailed)
    }

    fn with(mut self, from: Phase, trigger: Trigger, to: Phase) -> Self {
        self.edges.insert((from, trigger), to);
        self
    }

    /// Target phase, or `None` if the transition is not legal.
    pub fn next(&self, from: Phase, trigger: Trigger) -> Option<Phase> {
        self.edges.get(&(from, trigger)).copied()
    }

    /// Check if a transition is legal.
    pub fn allows(&self, from: Phase, trigger: Trigger) -> bool {
        self.edges.contains_key(&(from, trigger))
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_only_from_absent_or_failed() {
        let table = TransitionTable::standard();
        assert_eq!(table.next(Phase::Absent, Trigger::Install), Some(Phase::PendingAdd));
        assert_eq!(
            table.next(Phase::PendingAddFailed, Trigger::Install),
            Some(Phase::PendingAdd)
        );
        assert!(!table.allows(Phase::PendingAdd, Trigger::Install));
        assert!(!table.allows(Phase::Added, Trigger::Install));
    }

    #[test]
    fn acks_on_settled_states_are_ignored() {
        let table = TransitionTable::standard();
        assert!(!table.allows(Phase::Added, Trigger::DeviceAck));
        assert!(!table.allows(Phase::Absent, Trigger::DeviceAck));
        assert!(!table.allows(Phase::Removed, Trigger::DeviceAck));
        assert!(!table.allows(Phase::PendingAddFailed, Trigger::DeviceAck));
    }

    #[test]
    fn failed_phases_map_to_pending_states() {
        assert_eq!(
            Phase::PendingAddFailed.state(),
            Some(LifecycleState::PendingAdd)
        );
        assert_eq!(
            Phase::PendingRemoveFailed.state(),
            Some(LifecycleState::PendingRemove)
        );
        assert!(Phase::PendingRemoveFailed.is_failed());
        assert_eq!(Phase::Absent.state(), None);
    }
}
