//! Replicated map, allocator and transition table tests.

use meterstore::control::capabilities::{CapabilityRegistry, DeviceCapabilities, CAPABILITY_MAP};
use meterstore::control::mastership::NodeId;
use meterstore::core::config::MAX_POOL_SIZE;
use meterstore::core::error::StoreError;
use meterstore::store::allocator::{IdAllocator, IdPool, ID_POOL_MAP};
use meterstore::store::map::{MapEvent, MapEventType, MapListener, ReplicatedMap, Update};
use meterstore::store::memory::{ClusterNode, InMemoryCluster};
use meterstore::store::record::{DeviceId, LifecycleState};
use meterstore::store::transition::{Phase, Trigger, TransitionTable};
use parking_lot::Mutex;
use std::sync::Arc;

fn allocator_on(node: &ClusterNode, default_capacity: u32) -> IdAllocator {
    let pools: Arc<dyn ReplicatedMap<DeviceId, IdPool>> =
        Arc::new(node.map::<DeviceId, IdPool>(ID_POOL_MAP));
    let capabilities = Arc::new(CapabilityRegistry::new(Arc::new(
        node.map::<DeviceId, DeviceCapabilities>(CAPABILITY_MAP),
    )));
    IdAllocator::new(pools, capabilities, default_capacity)
}

#[derive(Default)]
struct Collect {
    seen: Mutex<Vec<(MapEventType, String, Option<u32>)>>,
}

impl MapListener<String, u32> for Collect {
    fn event(&self, event: &MapEvent<String, u32>) {
        self.seen.lock().push((
            event.event_type,
            event.key.clone(),
            event.new_value.as_ref().map(|v| v.value),
        ));
    }
}

// ============================================================================
// Replicated map tests
// ============================================================================

#[test]
fn writes_are_visible_and_announced_on_every_node() {
    let cluster = InMemoryCluster::new();
    let a = cluster.join(NodeId::new("a")).map::<String, u32>("counters");
    let b = cluster.join(NodeId::new("b")).map::<String, u32>("counters");
    let seen_a = Arc::new(Collect::default());
    let seen_b = Arc::new(Collect::default());
    a.add_listener(seen_a.clone());
    b.add_listener(seen_b.clone());

    a.put("x".to_string(), 1).unwrap();
    b.compute(&"x".to_string(), &mut |v| Update::Set(v.copied().unwrap_or(0) + 1))
        .unwrap();
    a.remove(&"x".to_string()).unwrap();

    let expected = vec![
        (MapEventType::Insert, "x".to_string(), Some(1)),
        (MapEventType::Update, "x".to_string(), Some(2)),
        (MapEventType::Remove, "x".to_string(), None),
    ];
    assert_eq!(*seen_a.seen.lock(), expected);
    assert_eq!(*seen_b.seen.lock(), expected);
    assert!(b.get(&"x".to_string()).unwrap().is_none());
}

#[test]
fn versions_increase_per_write() {
    let cluster = InMemoryCluster::new();
    let map = cluster.join(NodeId::new("a")).map::<String, u32>("m");

    map.put("a".to_string(), 1).unwrap();
    map.put("b".to_string(), 2).unwrap();
    let a = map.get(&"a".to_string()).unwrap().unwrap();
    let b = map.get(&"b".to_string()).unwrap().unwrap();
    assert!(b.version > a.version);
    assert_eq!(cluster.write_count("m"), 2);

    let entries = map.entries().unwrap();
    assert_eq!(entries.len(), 2);
}

#[test]
fn compute_if_present_skips_missing_keys() {
    let cluster = InMemoryCluster::new();
    let map = cluster.join(NodeId::new("a")).map::<String, u32>("m");

    let mut called = false;
    let result = map
        .compute_if_present(&"missing".to_string(), &mut |_| {
            called = true;
            Update::Remove
        })
        .unwrap();
    assert!(result.is_none());
    assert!(!called);
    assert_eq!(cluster.write_count("m"), 0);
}

// ============================================================================
// Allocator tests
// ============================================================================

#[test]
fn allocators_on_different_nodes_share_one_pool() {
    let cluster = InMemoryCluster::new();
    let a1 = allocator_on(&cluster.join(NodeId::new("n1")), 16);
    let a2 = allocator_on(&cluster.join(NodeId::new("n2")), 16);
    let device = DeviceId::new("of:1");

    assert_eq!(a1.acquire(&device).unwrap(), Some(1));
    assert_eq!(a2.acquire(&device).unwrap(), Some(2));
    assert_eq!(a1.acquire(&device).unwrap(), Some(3));
    assert_eq!(a2.in_use(&device).unwrap(), 3);

    assert!(a2.release(&device, 1).unwrap());
    assert!(!a1.release(&device, 1).unwrap());
    assert_eq!(a1.acquire(&device).unwrap(), Some(1));
}

#[test]
fn capacity_follows_published_capabilities() {
    let cluster = InMemoryCluster::new();
    let node = cluster.join(NodeId::new("n1"));
    let allocator = allocator_on(&node, 1024);
    let registry = CapabilityRegistry::new(Arc::new(
        node.map::<DeviceId, DeviceCapabilities>(CAPABILITY_MAP),
    ));
    let device = DeviceId::new("of:1");
    registry
        .publish(DeviceCapabilities::new(device.clone(), 2))
        .unwrap();

    assert_eq!(allocator.acquire(&device).unwrap(), Some(1));
    assert_eq!(allocator.acquire(&device).unwrap(), Some(2));
    let writes = cluster.write_count(ID_POOL_MAP);
    assert_eq!(allocator.acquire(&device).unwrap(), None);
    assert_eq!(cluster.write_count(ID_POOL_MAP), writes);
}

#[test]
fn pool_size_is_clamped_for_huge_tables() {
    let cluster = InMemoryCluster::new();
    let node = cluster.join(NodeId::new("n1"));
    let allocator = allocator_on(&node, 8);
    let registry = CapabilityRegistry::new(Arc::new(
        node.map::<DeviceId, DeviceCapabilities>(CAPABILITY_MAP),
    ));
    let device = DeviceId::new("of:1");
    registry
        .publish(DeviceCapabilities::new(device.clone(), u32::MAX))
        .unwrap();

    assert_eq!(allocator.range_for(&device).unwrap(), (1, MAX_POOL_SIZE));
    assert_eq!(allocator.acquire(&device).unwrap(), Some(1));
    assert!(!allocator.reserve(&device, MAX_POOL_SIZE + 1).unwrap());
    assert!(allocator.reserve(&device, MAX_POOL_SIZE).unwrap());
}

#[test]
fn reserve_respects_published_index_range() {
    let cluster = InMemoryCluster::new();
    let node = cluster.join(NodeId::new("n1"));
    let allocator = allocator_on(&node, 8);
    let registry = CapabilityRegistry::new(Arc::new(
        node.map::<DeviceId, DeviceCapabilities>(CAPABILITY_MAP),
    ));
    let device = DeviceId::new("of:1");
    registry
        .publish(DeviceCapabilities::new(device.clone(), 4).with_index_range(100, 103))
        .unwrap();

    assert!(!allocator.reserve(&device, 1).unwrap());
    assert!(allocator.reserve(&device, 100).unwrap());
    assert_eq!(allocator.acquire(&device).unwrap(), Some(101));
    assert!(!allocator.reserve(&device, 104).unwrap());
}

#[test]
fn reserve_and_drop_pool() {
    let cluster = InMemoryCluster::new();
    let allocator = allocator_on(&cluster.join(NodeId::new("n1")), 8);
    let device = DeviceId::new("of:1");

    assert!(allocator.reserve(&device, 4).unwrap());
    assert!(!allocator.reserve(&device, 4).unwrap());
    assert!(!allocator.reserve(&device, 0).unwrap());
    assert!(!allocator.reserve(&device, 9).unwrap());
    assert!(allocator.is_allocated(&device, 4).unwrap());
    assert_eq!(allocator.acquire(&device).unwrap(), Some(1));

    assert!(allocator.drop_pool(&device).unwrap());
    assert_eq!(allocator.in_use(&device).unwrap(), 0);
    assert!(!allocator.drop_pool(&device).unwrap());
}

#[test]
fn allocator_surfaces_storage_failures() {
    let cluster = InMemoryCluster::new();
    let allocator = allocator_on(&cluster.join(NodeId::new("n1")), 8);
    cluster.set_available(false);

    let err = allocator.acquire(&DeviceId::new("of:1")).unwrap_err();
    assert!(matches!(err, StoreError::StorageFailure { .. }));
}

// ============================================================================
// Transition table tests
// ============================================================================

#[test]
fn standard_table_walks_full_lifecycle() {
    let table = TransitionTable::standard();
    let mut phase = Phase::Absent;

    for (trigger, expected) in [
        (Trigger::Install, Phase::PendingAdd),
        (Trigger::DeviceReject, Phase::PendingAddFailed),
        (Trigger::Install, Phase::PendingAdd),
        (Trigger::DeviceAck, Phase::Added),
        (Trigger::DeviceStats, Phase::Added),
        (Trigger::Remove, Phase::PendingRemove),
        (Trigger::DeviceReject, Phase::PendingRemoveFailed),
        (Trigger::Remove, Phase::PendingRemove),
        (Trigger::DeviceAck, Phase::Removed),
    ] {
        phase = table.next(phase, trigger).unwrap();
        assert_eq!(phase, expected);
    }

    assert_eq!(phase.state(), Some(LifecycleState::Removed));
    assert!(!table.allows(Phase::Removed, Trigger::Install));
    assert!(!table.allows(Phase::Removed, Trigger::DeviceAck));
}

#[test]
fn standard_table_rejects_device_events_on_absent_keys() {
    let table = TransitionTable::standard();
    for trigger in [Trigger::DeviceAck, Trigger::DeviceReject, Trigger::DeviceStats] {
        assert_eq!(table.next(Phase::Absent, trigger), None);
    }
    assert_eq!(table.next(Phase::Added, Trigger::Install), None);
    assert_eq!(
        table.next(Phase::PendingAddFailed, Trigger::DeviceStats),
        Some(Phase::Added)
    );
}
