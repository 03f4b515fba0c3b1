//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use meterstore::control::mastership::NodeId;
use meterstore::core::error::OperationResult;
use meterstore::provider::{DeviceOperation, DeviceProvider};
use meterstore::store::coordinator::{LifecycleCoordinator, StoreOptions};
use meterstore::store::events::{LifecycleEvent, LifecycleEventType, LifecycleListener};
use meterstore::store::memory::InMemoryCluster;
use meterstore::store::pending::PendingOperation;
use meterstore::store::record::{AppId, DeviceId, MeterUnit, ResourceDescriptor};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Lifecycle listener that records everything it is handed.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn types(&self) -> Vec<LifecycleEventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }

    pub fn count(&self, event_type: LifecycleEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl LifecycleListener for RecordingListener {
    fn event(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Device provider that only records the operations it receives.
#[derive(Default)]
pub struct RecordingProvider {
    operations: Mutex<Vec<DeviceOperation>>,
}

impl RecordingProvider {
    pub fn operations(&self) -> Vec<DeviceOperation> {
        self.operations.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }
}

impl DeviceProvider for RecordingProvider {
    fn perform(&self, operation: DeviceOperation) {
        self.operations.lock().push(operation);
    }
}

/// One node of a test cluster.
pub struct TestNode {
    pub id: NodeId,
    pub coordinator: Arc<LifecycleCoordinator>,
    pub events: Arc<RecordingListener>,
}

/// Several coordinators sharing one in-memory cluster.
pub struct TestCluster {
    pub cluster: InMemoryCluster,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn new(size: usize) -> Self {
        Self::with_options(size, StoreOptions::default())
    }

    pub fn with_options(size: usize, options: StoreOptions) -> Self {
        let cluster = InMemoryCluster::new();
        let nodes = (1..=size)
            .map(|n| {
                let id = NodeId::new(format!("n{}", n));
                let node = cluster.join(id.clone());
                let coordinator = Arc::new(LifecycleCoordinator::on_node(&node, options.clone()));
                let events = Arc::new(RecordingListener::default());
                coordinator.add_listener(events.clone());
                TestNode {
                    id,
                    coordinator,
                    events,
                }
            })
            .collect();
        Self { cluster, nodes }
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    pub fn coordinator(&self, index: usize) -> &Arc<LifecycleCoordinator> {
        &self.nodes[index].coordinator
    }
}

/// Descriptor for a single drop band meter.
pub fn meter(device: &str) -> ResourceDescriptor {
    meter_for_app(device, "test-app")
}

/// Descriptor owned by a specific application.
pub fn meter_for_app(device: &str, app: &str) -> ResourceDescriptor {
    ResourceDescriptor::new(
        DeviceId::new(device),
        AppId::new(app),
        MeterUnit::KbPerSec,
        1_000,
    )
}

/// Outcome of an operation that must already be complete.
pub fn resolved(op: &mut PendingOperation) -> OperationResult {
    op.try_result().expect("operation should be resolved")
}

/// Await an operation with a timeout.
pub async fn settle(op: PendingOperation) -> OperationResult {
    tokio::time::timeout(Duration::from_secs(5), op)
        .await
        .expect("operation timed out")
}

/// Poll a condition until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Write a config file to a temporary path.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    config_file(
        r#"
[node]
node_id = "test-node"
"#,
    )
}
