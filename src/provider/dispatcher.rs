//! Mastership-gated dispatch of device operations.
//!
//! The dispatcher listens for `ADD_REQ` / `REM_REQ` lifecycle events on its
//! node and queues them without blocking. Worker tasks drain the queues and
//! call the provider only when the local node is the device's master at the
//! time of dispatch. Operations are spread over lanes by
//! `hash64(device_id, id) % workers`, so one meter's requests stay ordered.

use crate::control::mastership::{MastershipService, NodeId};
use crate::provider::{DeviceOperation, DeviceProvider};
use crate::store::events::{LifecycleEvent, LifecycleEventType, LifecycleListener};
use crate::store::reconcile::ReconcileReport;
use crate::store::record::ResourceKey;
use parking_lot::Mutex;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use twox_hash::XxHash64;

/// Counters of dispatched operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Operations handed to the provider.
    pub forwarded: u64,
    /// Operations dropped because another node is master.
    pub skipped: u64,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    skipped: AtomicU64,
}

/// Forwards lifecycle requests to the device provider.
pub struct DeviceDispatcher {
    local: NodeId,
    lanes: Mutex<Vec<mpsc::UnboundedSender<DeviceOperation>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    lane_count: usize,
    counters: Arc<Counters>,
}

impl DeviceDispatcher {
    /// Spawn the worker tasks. Must be called inside a tokio runtime.
    pub fn start(
        local: NodeId,
        workers: usize,
        mastership: Arc<dyn MastershipService>,
        provider: Arc<dyn DeviceProvider>,
    ) -> Arc<Self> {
        let lane_count = workers.max(1);
        let counters = Arc::new(Counters::default());
        let mut lanes = Vec::with_capacity(lane_count);
        let mut handles = Vec::with_capacity(lane_count);

        for lane in 0..lane_count {
            let (tx, rx) = mpsc::unbounded_channel();
            lanes.push(tx);
            handles.push(tokio::spawn(run_lane(
                lane,
                local.clone(),
                rx,
                Arc::clone(&mastership),
                Arc::clone(&provider),
                Arc::clone(&counters),
            )));
        }

        tracing::info!(node = %local, workers = lane_count, "device dispatcher started");
        Arc::new(Self {
            local,
            lanes: Mutex::new(lanes),
            workers: Mutex::new(handles),
            lane_count,
            counters,
        })
    }

    fn lane_for(&self, key: &ResourceKey) -> usize {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key.device_id.as_str().as_bytes());
        hasher.write(&key.id.to_be_bytes());
        (hasher.finish() % self.lane_count as u64) as usize
    }

    /// Queue an operation. Returns false once the dispatcher is stopped.
    pub fn submit(&self, operation: DeviceOperation) -> bool {
        let lane = self.lane_for(&operation.key);
        let lanes = self.lanes.lock();
        let Some(tx) = lanes.get(lane) else {
            tracing::warn!(key = %operation.key, "dispatcher stopped, dropping device operation");
            return false;
        };
        tx.send(operation).is_ok()
    }

    /// Queue the device operations a reconciliation asked for.
    pub fn forward_reconcile(&self, report: &ReconcileReport) -> usize {
        let mut queued = 0;
        for record in &report.reinstall {
            if self.submit(DeviceOperation::add(
                record.key.clone(),
                record.descriptor.clone(),
            )) {
                queued += 1;
            }
        }
        for key in &report.uninstall {
            if self.submit(DeviceOperation::remove(key.clone(), None)) {
                queued += 1;
            }
        }
        queued
    }

    /// Snapshot of the dispatch counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    /// Check if the dispatcher still accepts operations.
    pub fn is_running(&self) -> bool {
        !self.lanes.lock().is_empty()
    }

    /// Close the queues and wait for the workers to drain them.
    pub async fn stop(&self) {
        self.lanes.lock().clear();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "dispatch worker ended abnormally");
            }
        }
        tracing::info!(node = %self.local, "device dispatcher stopped");
    }
}

impl LifecycleListener for DeviceDispatcher {
    fn event(&self, event: &LifecycleEvent) {
        let record = &event.record;
        let operation = match event.event_type {
            LifecycleEventType::AddRequested => {
                DeviceOperation::add(record.key.clone(), record.descriptor.clone())
            }
            LifecycleEventType::RemoveRequested => {
                DeviceOperation::remove(record.key.clone(), Some(record.descriptor.clone()))
            }
            _ => return,
        };
        self.submit(operation);
    }
}

async fn run_lane(
    lane: usize,
    local: NodeId,
    mut rx: mpsc::UnboundedReceiver<DeviceOperation>,
    mastership: Arc<dyn MastershipService>,
    provider: Arc<dyn DeviceProvider>,
    counters: Arc<Counters>,
) {
    while let Some(operation) = rx.recv().await {
        if !mastership.is_master(&local, &operation.key.device_id) {
            tracing::trace!(lane, key = %operation.key, "not device master, skipping");
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        tracing::debug!(lane, key = %operation.key, op = %operation.op_type, "forwarding to device");
        counters.forwarded.fetch_add(1, Ordering::Relaxed);
        provider.perform(operation);
    }
}
