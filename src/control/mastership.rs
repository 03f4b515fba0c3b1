//! Cluster node identity and device mastership.
//!
//! Mastership is decided outside the store. The store only asks which node
//! currently holds it for a device, and forwards device-facing requests only
//! when the answer is the local node.

use crate::store::record::DeviceId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of a controller cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Source of device mastership decisions.
pub trait MastershipService: Send + Sync {
    /// Node currently allowed to issue device-facing requests for a device.
    fn master_for(&self, device_id: &DeviceId) -> Option<NodeId>;

    /// Check if the given node is the device's master.
    fn is_master(&self, node_id: &NodeId, device_id: &DeviceId) -> bool {
        self.master_for(device_id).as_ref() == Some(node_id)
    }
}

/// Mastership table with explicit assignments and an optional fallback.
///
/// Used by single-process deployments and tests; a real deployment plugs in
/// its own [`MastershipService`].
pub struct StaticMastership {
    assignments: RwLock<HashMap<DeviceId, NodeId>>,
    fallback: Option<NodeId>,
}

impl StaticMastership {
    /// Create a table with no assignments and no fallback.
    pub fn new() -> Self {
        Self {
            assignments: RwLock::new(HashMap::new()),
            fallback: None,
        }
    }

    /// Create a table where unassigned devices default to `node_id`.
    pub fn with_fallback(node_id: NodeId) -> Self {
        Self {
            assignments: RwLock::new(HashMap::new()),
            fallback: Some(node_id),
        }
    }

    /// Assign a device to a node.
    pub fn set_master(&self, device_id: DeviceId, node_id: NodeId) {
        tracing::debug!(device = %device_id, node = %node_id, "mastership assigned");
        self.assignments.write().insert(device_id, node_id);
    }

    /// Remove a device's assignment.
    pub fn clear_master(&self, device_id: &DeviceId) {
        self.assignments.write().remove(device_id);
    }

    /// Number of explicit assignments.
    pub fn assignment_count(&self) -> usize {
        self.assignments.read().len()
    }
}

impl Default for StaticMastership {
    fn default() -> Self {
        Self::new()
    }
}

impl MastershipService for StaticMastership {
    fn master_for(&self, device_id: &DeviceId) -> Option<NodeId> {
        self.assignments
            .read()
            .get(device_id)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}
