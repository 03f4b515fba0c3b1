//! Device dispatcher and loopback provider tests.

mod common;

use common::{eventually, meter, settle, RecordingProvider, TestCluster};
use meterstore::control::mastership::{MastershipService, StaticMastership};
use meterstore::core::error::OperationError;
use meterstore::provider::{DeviceDispatcher, DeviceOpType, DeviceProvider, LoopbackProvider};
use meterstore::store::reconcile::ReconcileReport;
use meterstore::store::record::{DeviceId, FailReason, LifecycleState, ResourceKey};
use std::sync::Arc;

fn mastership_for(tc: &TestCluster, device: &str, master: usize) -> Arc<dyn MastershipService> {
    let table = StaticMastership::new();
    table.set_master(DeviceId::new(device), tc.node(master).id.clone());
    Arc::new(table)
}

#[tokio::test]
async fn requests_forwarded_only_by_device_master() {
    let tc = TestCluster::new(2);
    let mastership = mastership_for(&tc, "of:1", 1);

    let p1 = Arc::new(RecordingProvider::default());
    let p2 = Arc::new(RecordingProvider::default());
    let d1 = DeviceDispatcher::start(tc.node(0).id.clone(), 2, mastership.clone(), p1.clone());
    let d2 = DeviceDispatcher::start(tc.node(1).id.clone(), 2, mastership.clone(), p2.clone());
    tc.coordinator(0).add_listener(d1.clone());
    tc.coordinator(1).add_listener(d2.clone());

    let op = tc.coordinator(0).install(meter("of:1")).unwrap();
    let k = op.key().clone();

    assert!(eventually(|| p2.len() == 1 && d1.stats().skipped == 1).await);
    assert_eq!(p1.len(), 0);
    let forwarded = &p2.operations()[0];
    assert_eq!(forwarded.op_type, DeviceOpType::Add);
    assert_eq!(forwarded.key, k);
    assert!(forwarded.descriptor.is_some());

    // The master's callback resolves the origin's future.
    tc.coordinator(1).device_ack(&k).unwrap();
    assert_eq!(settle(op).await, Ok(()));

    let remove = tc.coordinator(0).remove(&k);
    assert!(eventually(|| p2.len() == 2).await);
    assert_eq!(p2.operations()[1].op_type, DeviceOpType::Remove);
    tc.coordinator(1).device_ack(&k).unwrap();
    assert_eq!(settle(remove).await, Ok(()));

    assert_eq!(d2.stats().forwarded, 2);
    assert_eq!(d1.stats().forwarded, 0);

    d1.stop().await;
    d2.stop().await;
}

#[tokio::test]
async fn stopped_dispatcher_refuses_operations() {
    let tc = TestCluster::new(1);
    let mastership: Arc<dyn MastershipService> =
        Arc::new(StaticMastership::with_fallback(tc.node(0).id.clone()));
    let provider = Arc::new(RecordingProvider::default());
    let dispatcher = DeviceDispatcher::start(tc.node(0).id.clone(), 1, mastership, provider.clone());
    assert!(dispatcher.is_running());

    dispatcher.stop().await;
    assert!(!dispatcher.is_running());

    let report = ReconcileReport {
        uninstall: vec![ResourceKey::new(DeviceId::new("of:1"), 3)],
        ..ReconcileReport::default()
    };
    assert_eq!(dispatcher.forward_reconcile(&report), 0);
    assert_eq!(provider.len(), 0);
}

#[tokio::test]
async fn reconcile_report_forwarded_to_device() {
    let tc = TestCluster::new(1);
    let coordinator = tc.coordinator(0);
    let mastership: Arc<dyn MastershipService> =
        Arc::new(StaticMastership::with_fallback(tc.node(0).id.clone()));
    let provider = Arc::new(RecordingProvider::default());
    let dispatcher = DeviceDispatcher::start(tc.node(0).id.clone(), 2, mastership, provider.clone());

    let lost = coordinator.install(meter("of:1")).unwrap();
    let report = coordinator
        .reconcile(
            &DeviceId::new("of:1"),
            &[meterstore::store::reconcile::DeviceEntry::new(
                7,
                Default::default(),
            )],
        )
        .unwrap();
    assert_eq!(dispatcher.forward_reconcile(&report), 2);

    assert!(eventually(|| provider.len() == 2).await);
    let operations = provider.operations();
    let add = operations
        .iter()
        .find(|o| o.op_type == DeviceOpType::Add)
        .unwrap();
    assert_eq!(&add.key, lost.key());
    let remove = operations
        .iter()
        .find(|o| o.op_type == DeviceOpType::Remove)
        .unwrap();
    assert_eq!(remove.key.id, 7);
    assert!(remove.descriptor.is_none());

    dispatcher.stop().await;
}

#[tokio::test]
async fn loopback_round_trip_across_nodes() {
    let tc = TestCluster::new(2);
    let mastership = mastership_for(&tc, "of:1", 1);

    let loopbacks: Vec<Arc<LoopbackProvider>> = (0..2)
        .map(|n| Arc::new(LoopbackProvider::new(tc.coordinator(n))))
        .collect();
    let dispatchers: Vec<Arc<DeviceDispatcher>> = (0..2)
        .map(|n| {
            let provider: Arc<dyn DeviceProvider> = loopbacks[n].clone();
            let dispatcher =
                DeviceDispatcher::start(tc.node(n).id.clone(), 2, mastership.clone(), provider);
            tc.coordinator(n).add_listener(dispatcher.clone());
            dispatcher
        })
        .collect();

    let op = tc.coordinator(0).install(meter("of:1")).unwrap();
    let k = op.key().clone();
    assert_eq!(settle(op).await, Ok(()));
    assert_eq!(
        tc.coordinator(0).get(&k).unwrap().unwrap().state,
        LifecycleState::Added
    );
    assert_eq!(loopbacks[1].entries(&k.device_id).len(), 1);
    assert!(loopbacks[0].entries(&k.device_id).is_empty());

    assert_eq!(settle(tc.coordinator(0).remove(&k)).await, Ok(()));
    assert!(tc.coordinator(1).list_all().unwrap().is_empty());
    assert!(loopbacks[1].entries(&k.device_id).is_empty());

    for dispatcher in dispatchers {
        dispatcher.stop().await;
    }
}

#[tokio::test]
async fn loopback_scripted_failure() {
    let tc = TestCluster::new(1);
    let mastership: Arc<dyn MastershipService> =
        Arc::new(StaticMastership::with_fallback(tc.node(0).id.clone()));
    let loopback = Arc::new(LoopbackProvider::new(tc.coordinator(0)));
    let dispatcher =
        DeviceDispatcher::start(tc.node(0).id.clone(), 1, mastership, loopback.clone());
    tc.coordinator(0).add_listener(dispatcher.clone());

    let k = ResourceKey::new(DeviceId::new("of:1"), 1);
    loopback.fail_next(k.clone(), FailReason::OutOfMeters);

    let op = tc.coordinator(0).install(meter("of:1")).unwrap();
    assert_eq!(op.key(), &k);
    assert_eq!(
        settle(op).await,
        Err(OperationError::DeviceRejected {
            reason: FailReason::OutOfMeters
        })
    );
    let record = tc.coordinator(0).get(&k).unwrap().unwrap();
    assert_eq!(record.state, LifecycleState::PendingAdd);
    assert_eq!(record.reason, Some(FailReason::OutOfMeters));
    assert!(loopback.entries(&k.device_id).is_empty());

    dispatcher.stop().await;
}

#[tokio::test]
async fn loopback_inject_and_forget_drive_reconcile() {
    let tc = TestCluster::new(1);
    let mastership: Arc<dyn MastershipService> =
        Arc::new(StaticMastership::with_fallback(tc.node(0).id.clone()));
    let loopback = Arc::new(LoopbackProvider::new(tc.coordinator(0)));
    let dispatcher =
        DeviceDispatcher::start(tc.node(0).id.clone(), 2, mastership, loopback.clone());
    tc.coordinator(0).add_listener(dispatcher.clone());

    let op = tc.coordinator(0).install(meter("of:1")).unwrap();
    let k = op.key().clone();
    assert_eq!(settle(op).await, Ok(()));

    let device = DeviceId::new("of:1");
    assert!(loopback.forget(&k));
    loopback.inject(ResourceKey::new(device.clone(), 30), Default::default());

    let report = tc
        .coordinator(0)
        .reconcile(&device, &loopback.entries(&device))
        .unwrap();
    assert_eq!(report.reinstall.len(), 1);
    assert_eq!(report.uninstall.len(), 1);

    assert_eq!(dispatcher.forward_reconcile(&report), 2);
    assert!(eventually(|| {
        let ids: Vec<u32> = loopback.entries(&device).iter().map(|e| e.id).collect();
        ids == vec![k.id]
    })
    .await);

    dispatcher.stop().await;
}
