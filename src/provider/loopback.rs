//! Loopback device provider.
//!
//! Keeps a per-device meter table in memory and acknowledges every operation
//! straight back to the coordinator. Failures can be scripted per key. Used
//! by the `simulate` command, single-process deployments and tests.

use crate::provider::{DeviceOpType, DeviceOperation, DeviceProvider};
use crate::store::coordinator::LifecycleCoordinator;
use crate::store::reconcile::DeviceEntry;
use crate::store::record::{DeviceId, FailReason, MeterCounters, ResourceKey};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

/// In-memory device that echoes operations back as acknowledgements.
pub struct LoopbackProvider {
    coordinator: Weak<LifecycleCoordinator>,
    tables: Mutex<HashMap<DeviceId, BTreeMap<u32, MeterCounters>>>,
    scripted: Mutex<HashMap<ResourceKey, FailReason>>,
}

impl LoopbackProvider {
    /// Create a provider reporting to the given coordinator.
    pub fn new(coordinator: &Arc<LifecycleCoordinator>) -> Self {
        Self {
            coordinator: Arc::downgrade(coordinator),
            tables: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next operation on a key fail with the given reason.
    pub fn fail_next(&self, key: ResourceKey, reason: FailReason) {
        self.scripted.lock().insert(key, reason);
    }

    /// Meters currently programmed on a device.
    pub fn entries(&self, device_id: &DeviceId) -> Vec<DeviceEntry> {
        self.tables
            .lock()
            .get(device_id)
            .map(|table| {
                table
                    .iter()
                    .map(|(id, counters)| DeviceEntry::new(*id, *counters))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop a meter from the device table without telling the store.
    pub fn forget(&self, key: &ResourceKey) -> bool {
        self.tables
            .lock()
            .get_mut(&key.device_id)
            .is_some_and(|table| table.remove(&key.id).is_some())
    }

    /// Put a meter into the device table without telling the store.
    pub fn inject(&self, key: ResourceKey, counters: MeterCounters) {
        self.tables
            .lock()
            .entry(key.device_id)
            .or_default()
            .insert(key.id, counters);
    }
}

impl DeviceProvider for LoopbackProvider {
    fn perform(&self, operation: DeviceOperation) {
        let Some(coordinator) = self.coordinator.upgrade() else {
            tracing::debug!(key = %operation.key, "coordinator gone, dropping device operation");
            return;
        };
        let key = operation.key;
        let scripted = self.scripted.lock().remove(&key);

        let result = match scripted {
            Some(reason) => coordinator.device_failure(&key, reason),
            None => {
                {
                    let mut tables = self.tables.lock();
                    let table = tables.entry(key.device_id.clone()).or_default();
                    match operation.op_type {
                        DeviceOpType::Add => {
                            table.entry(key.id).or_default();
                        }
                        DeviceOpType::Remove => {
                            table.remove(&key.id);
                        }
                    }
                }
                // Meters found only on the device have no record to acknowledge.
                if operation.descriptor.is_none() {
                    return;
                }
                coordinator.device_ack(&key)
            }
        };

        if let Err(e) = result {
            tracing::warn!(key = %key, error = %e, "loopback callback failed");
        }
    }
}
