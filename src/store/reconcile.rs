//! Device state reconciliation.
//!
//! A device periodically reports the meters it actually holds. Comparing
//! that report with the store yields the device operations needed to bring
//! the two back in line, and acknowledges removals the device has already
//! carried out.

use crate::core::error::StoreResult;
use crate::store::coordinator::LifecycleCoordinator;
use crate::store::record::{DeviceId, LifecycleState, MeterCounters, ResourceKey, StateRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A meter as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Identifier on the device.
    pub id: u32,
    /// Counters the device keeps for it.
    pub counters: MeterCounters,
}

impl DeviceEntry {
    /// Create an entry.
    pub fn new(id: u32, counters: MeterCounters) -> Self {
        Self { id, counters }
    }
}

/// Result of reconciling one device report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records the device lost; their install must be sent again.
    pub reinstall: Vec<StateRecord>,
    /// Device meters the store does not know; they must be removed.
    pub uninstall: Vec<ResourceKey>,
    /// Records whose counters or state were refreshed from the report.
    pub advanced: usize,
    /// Pending removals the device already completed.
    pub acknowledged_removals: usize,
}

impl ReconcileReport {
    /// Check if no device operation is needed.
    pub fn is_clean(&self) -> bool {
        self.reinstall.is_empty() && self.uninstall.is_empty()
    }
}

impl LifecycleCoordinator {
    /// Reconcile the store with the meters a device reports.
    pub fn reconcile(
        &self,
        device_id: &DeviceId,
        reported: &[DeviceEntry],
    ) -> StoreResult<ReconcileReport> {
        let mut stored: HashMap<u32, StateRecord> = self
            .list_device(device_id)?
            .into_iter()
            .map(|r| (r.key.id, r))
            .collect();
        let mut report = ReconcileReport::default();

        for entry in reported {
            let key = ResourceKey::new(device_id.clone(), entry.id);
            match stored.remove(&entry.id) {
                Some(record) if record.state == LifecycleState::PendingAdd
                    || record.state == LifecycleState::Added =>
                {
                    self.update_from_device(&key, entry.counters)?;
                    report.advanced += 1;
                }
                // Removal still owed on the device; the dispatcher already has it.
                Some(_) => {}
                None => report.uninstall.push(key),
            }
        }

        for (_, record) in stored {
            match record.state {
                LifecycleState::PendingAdd | LifecycleState::Added => report.reinstall.push(record),
                LifecycleState::PendingRemove => {
                    self.device_ack(&record.key)?;
                    report.acknowledged_removals += 1;
                }
                LifecycleState::Removed => {}
            }
        }

        report.reinstall.sort_by(|a, b| a.key.cmp(&b.key));
        tracing::debug!(
            device = %device_id,
            reinstall = report.reinstall.len(),
            uninstall = report.uninstall.len(),
            advanced = report.advanced,
            removed = report.acknowledged_removals,
            "device reconciled"
        );
        Ok(report)
    }
}
