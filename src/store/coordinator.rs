//! Lifecycle coordinator.
//!
//! One coordinator runs on every node against the same replicated maps. It
//! writes state records, keeps the local table of pending futures and
//! reacts to record change events from every node:
//!
//! - `ADD_REQ` / `REM_REQ` are posted on every node; the device dispatcher
//!   forwards them only where the local node is the device master.
//! - `ADDED` / `REMOVED` are posted only on the node named as the record's
//!   origin, and futures resolve only where the pending table holds the key.
//! - The origin consumes its own `REMOVED` tombstone: it deletes the entry,
//!   frees the identifier and resolves the remove.
//!
//! If the origin dies before resolution its future is lost with it; nothing
//! takes over.

use crate::control::capabilities::{CapabilityRegistry, DeviceCapabilities, CAPABILITY_MAP};
use crate::control::mastership::NodeId;
use crate::core::error::{OperationError, StoreError, StoreResult};
use crate::store::allocator::{IdAllocator, IdPool, ID_POOL_MAP};
use crate::store::events::{EventBus, LifecycleEvent, LifecycleEventType, LifecycleListener};
use crate::store::map::{ListenerId, MapEvent, MapEventType, MapListener, ReplicatedMap, Update};
use crate::store::memory::ClusterNode;
use crate::store::pending::{OperationKind, PendingOperation, PendingTable};
use crate::store::record::{
    AppId, DeviceId, FailReason, LifecycleState, MeterCounters, ResourceDescriptor, ResourceKey,
    StateRecord,
};
use crate::store::transition::{Phase, Trigger, TransitionTable};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Name of the replicated state record map.
pub const RECORD_MAP: &str = "meterstore-records";

/// Behavior switches of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Pool size for devices that published no capabilities.
    pub default_max_ids: u32,
    /// Callers choose identifiers instead of the allocator.
    pub user_defined_index: bool,
    /// Purge a device's records when it disconnects.
    pub purge_on_disconnect: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            default_max_ids: 1024,
            user_defined_index: false,
            purge_on_disconnect: false,
        }
    }
}

/// Outcome of applying a trigger through the table.
enum Applied {
    Absent,
    Ignored(Phase),
    /// Phase before the write, and the record after it.
    Written(Phase, Option<StateRecord>),
}

struct Inner {
    local: NodeId,
    records: Arc<dyn ReplicatedMap<ResourceKey, StateRecord>>,
    allocator: IdAllocator,
    capabilities: Arc<CapabilityRegistry>,
    table: TransitionTable,
    pending: PendingTable,
    bus: EventBus,
    options: StoreOptions,
    closed: AtomicBool,
}

/// Distributed meter lifecycle coordinator for one node.
pub struct LifecycleCoordinator {
    inner: Arc<Inner>,
    watcher: Mutex<Option<ListenerId>>,
}

struct RecordWatcher {
    inner: Weak<Inner>,
}

impl MapListener<ResourceKey, StateRecord> for RecordWatcher {
    fn event(&self, event: &MapEvent<ResourceKey, StateRecord>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_record_event(event);
        }
    }
}

impl LifecycleCoordinator {
    /// Create a coordinator and start watching the record map.
    pub fn new(
        local: NodeId,
        records: Arc<dyn ReplicatedMap<ResourceKey, StateRecord>>,
        pools: Arc<dyn ReplicatedMap<DeviceId, IdPool>>,
        capabilities: Arc<CapabilityRegistry>,
        options: StoreOptions,
    ) -> Self {
        let allocator = IdAllocator::new(
            pools,
            Arc::clone(&capabilities),
            options.default_max_ids,
        );
        let inner = Arc::new(Inner {
            local,
            records,
            allocator,
            capabilities,
            table: TransitionTable::standard(),
            pending: PendingTable::new(),
            bus: EventBus::new(),
            options,
            closed: AtomicBool::new(false),
        });

        let watcher = inner.records.add_listener(Arc::new(RecordWatcher {
            inner: Arc::downgrade(&inner),
        }));
        tracing::info!(node = %inner.local, map = %inner.records.name(), "lifecycle coordinator started");

        Self {
            inner,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    /// Create a coordinator on a node of an in-memory cluster.
    pub fn on_node(node: &ClusterNode, options: StoreOptions) -> Self {
        let records: Arc<dyn ReplicatedMap<ResourceKey, StateRecord>> =
            Arc::new(node.map::<ResourceKey, StateRecord>(RECORD_MAP));
        let pools: Arc<dyn ReplicatedMap<DeviceId, IdPool>> =
            Arc::new(node.map::<DeviceId, IdPool>(ID_POOL_MAP));
        let capabilities = Arc::new(CapabilityRegistry::new(Arc::new(
            node.map::<DeviceId, DeviceCapabilities>(CAPABILITY_MAP),
        )));
        Self::new(node.node_id().clone(), records, pools, capabilities, options)
    }

    /// Identity of the local node.
    pub fn local_node(&self) -> &NodeId {
        &self.inner.local
    }

    /// Capability registry consulted on install.
    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.capabilities
    }

    /// Identifier allocator.
    pub fn allocator(&self) -> &IdAllocator {
        &self.inner.allocator
    }

    /// Behavior switches.
    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Number of unresolved local operations.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Check if [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Request installation of a meter.
    ///
    /// Validation, capacity and identifier exhaustion fail synchronously
    /// before any map write. Storage failures are delivered through the
    /// returned operation, which is then already complete.
    pub fn install(&self, descriptor: ResourceDescriptor) -> StoreResult<PendingOperation> {
        let fallback = ResourceKey::new(
            descriptor.device_id.clone(),
            descriptor.index.unwrap_or(0),
        );
        if self.is_shut_down() {
            return Ok(PendingOperation::ready(fallback, Err(OperationError::Shutdown)));
        }

        match self.inner.install(descriptor) {
            Ok(op) => Ok(op),
            Err(e) if e.is_storage_failure() => {
                tracing::warn!(key = %fallback, error = %e, "install failed on storage");
                Ok(PendingOperation::ready(fallback, Err(e.into())))
            }
            Err(e) => Err(e),
        }
    }

    /// Request removal of a meter.
    ///
    /// Removing an absent key completes successfully at once.
    pub fn remove(&self, key: &ResourceKey) -> PendingOperation {
        if self.is_shut_down() {
            return PendingOperation::ready(key.clone(), Err(OperationError::Shutdown));
        }
        self.inner.remove(key)
    }

    /// Request removal of the meter a descriptor was installed as.
    ///
    /// The descriptor must carry the identifier assigned at install, as the
    /// one stored in the record does.
    pub fn remove_descriptor(&self, descriptor: &ResourceDescriptor) -> PendingOperation {
        match descriptor.index {
            Some(id) => self.remove(&ResourceKey::new(descriptor.device_id.clone(), id)),
            None => PendingOperation::ready(
                ResourceKey::new(descriptor.device_id.clone(), 0),
                Err(OperationError::Invalid {
                    message: "descriptor carries no identifier".to_string(),
                }),
            ),
        }
    }

    /// Read a record.
    pub fn get(&self, key: &ResourceKey) -> StoreResult<Option<StateRecord>> {
        Ok(self.inner.records.get(key)?.map(|v| v.value))
    }

    /// Snapshot of every record.
    pub fn list_all(&self) -> StoreResult<Vec<StateRecord>> {
        Ok(self
            .inner
            .records
            .entries()?
            .into_iter()
            .map(|(_, v)| v.value)
            .collect())
    }

    /// Snapshot of one device's records.
    pub fn list_device(&self, device_id: &DeviceId) -> StoreResult<Vec<StateRecord>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|r| &r.key.device_id == device_id)
            .collect())
    }

    /// Register a lifecycle listener on this node.
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        self.inner.bus.add(listener)
    }

    /// Deregister a lifecycle listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.bus.remove(id)
    }

    /// Device confirmed the in-flight operation for a key.
    ///
    /// Fails with `NotFound` if the key holds no record. An acknowledgement
    /// that matches no legal transition is logged and ignored.
    pub fn device_ack(&self, key: &ResourceKey) -> StoreResult<()> {
        match self.inner.apply(key, Trigger::DeviceAck, |record, to| {
            record.state = to.state().unwrap_or(record.state);
            record.reason = None;
        })? {
            Applied::Absent => Err(StoreError::NotFound { key: key.clone() }),
            Applied::Ignored(phase) => {
                tracing::warn!(key = %key, phase = %phase, "ignoring device ack");
                Ok(())
            }
            Applied::Written(..) => {
                tracing::debug!(key = %key, "device ack applied");
                Ok(())
            }
        }
    }

    /// Device rejected the in-flight operation for a key.
    pub fn device_failure(&self, key: &ResourceKey, reason: FailReason) -> StoreResult<()> {
        match self.inner.apply(key, Trigger::DeviceReject, |record, _| {
            record.reason = Some(reason);
        })? {
            Applied::Absent => Err(StoreError::NotFound { key: key.clone() }),
            Applied::Ignored(phase) => {
                tracing::warn!(key = %key, phase = %phase, reason = %reason, "ignoring device failure");
                Ok(())
            }
            Applied::Written(..) => {
                tracing::debug!(key = %key, reason = %reason, "device failure applied");
                Ok(())
            }
        }
    }

    /// Device reported counters for a meter.
    ///
    /// Moves a pending install to ADDED and refreshes counters of an
    /// installed meter. A refresh of a meter that was already ADDED posts
    /// `REFERENCE_COUNT_ZERO` locally when no flow references it.
    pub fn update_from_device(&self, key: &ResourceKey, counters: MeterCounters) -> StoreResult<()> {
        match self.inner.apply(key, Trigger::DeviceStats, |record, _| {
            record.state = LifecycleState::Added;
            record.reason = None;
            record.counters = counters;
        })? {
            Applied::Absent => Err(StoreError::NotFound { key: key.clone() }),
            Applied::Ignored(phase) => {
                tracing::debug!(key = %key, phase = %phase, "ignoring device stats");
                Ok(())
            }
            Applied::Written(before, record) => {
                if let Some(record) = record {
                    if before == Phase::Added && record.counters.reference_count == 0 {
                        self.inner.bus.post(LifecycleEvent::new(
                            LifecycleEventType::ReferenceCountZero,
                            record,
                        ));
                    }
                }
                Ok(())
            }
        }
    }

    /// Forcibly delete a record whatever its state.
    ///
    /// Frees the identifier and posts `REMOVED` on this node. Returns false
    /// if the key held no record.
    pub fn purge(&self, key: &ResourceKey) -> StoreResult<bool> {
        self.inner.purge(key)
    }

    /// Forcibly delete every record of a device.
    pub fn purge_device(&self, device_id: &DeviceId) -> StoreResult<usize> {
        self.purge_matching(device_id, |_| true)
    }

    /// Forcibly delete a device's records owned by one application.
    pub fn purge_app(&self, device_id: &DeviceId, app_id: &AppId) -> StoreResult<usize> {
        self.purge_matching(device_id, |r| &r.descriptor.app_id == app_id)
    }

    fn purge_matching(
        &self,
        device_id: &DeviceId,
        filter: impl Fn(&StateRecord) -> bool,
    ) -> StoreResult<usize> {
        let mut purged = 0;
        for record in self.list_device(device_id)?.into_iter().filter(|r| filter(r)) {
            if self.inner.purge(&record.key)? {
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(device = %device_id, purged, "purged device records");
        }
        Ok(purged)
    }

    /// Handle a device leaving the network.
    ///
    /// Drops its capability record and, when configured, its records and
    /// identifier pool.
    pub fn device_disconnected(&self, device_id: &DeviceId) -> StoreResult<()> {
        self.inner.capabilities.remove(device_id)?;
        if self.inner.options.purge_on_disconnect {
            self.purge_device(device_id)?;
            self.inner.allocator.drop_pool(device_id)?;
        }
        Ok(())
    }

    /// Stop watching the map and fail every local pending operation.
    ///
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.watcher.lock().take() {
            self.inner.records.remove_listener(id);
        }
        let failed = self.inner.pending.fail_all(OperationError::Shutdown);
        self.inner.bus.clear();
        tracing::info!(node = %self.inner.local, failed, "lifecycle coordinator stopped");
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn install(&self, mut descriptor: ResourceDescriptor) -> StoreResult<PendingOperation> {
        let device_id = descriptor.device_id.clone();

        if descriptor.bands.is_empty() {
            return Err(StoreError::invalid("meter needs at least one band"));
        }
        match (self.options.user_defined_index, descriptor.index) {
            (false, Some(index)) => {
                return Err(StoreError::invalid(format!(
                    "index {} requested but user-defined indexes are disabled",
                    index
                )))
            }
            (true, None) => {
                return Err(StoreError::invalid(
                    "user-defined index mode requires an index",
                ))
            }
            _ => {}
        }
        self.capabilities.validate(&descriptor)?;

        let (key, allocated_here) = match descriptor.index {
            Some(index) => {
                let key = ResourceKey::new(device_id.clone(), index);
                let phase = Phase::of(self.records.get(&key)?.as_ref().map(|v| &v.value));
                if !self.table.allows(phase, Trigger::Install) {
                    return Err(StoreError::invalid(format!("{} is {}", key, phase)));
                }
                // A failed install keeps its identifier; only a fresh key reserves one.
                if phase == Phase::Absent {
                    self.check_capacity(&device_id)?;
                    if !self.allocator.reserve(&device_id, index)? {
                        return Err(StoreError::invalid(format!("index {} is in use", key)));
                    }
                    (key, true)
                } else {
                    (key, false)
                }
            }
            None => {
                self.check_capacity(&device_id)?;
                match self.allocator.acquire(&device_id)? {
                    Some(id) => (ResourceKey::new(device_id.clone(), id), true),
                    None => return Err(StoreError::IdExhausted { device_id }),
                }
            }
        };
        descriptor.index = Some(key.id);

        let (ticket, op) = self.pending.register(key.clone(), OperationKind::Install);
        let record = StateRecord::pending_add(key.clone(), descriptor, self.local.clone());

        let mut ignored = None;
        let written = self.records.compute(&key, &mut |current| {
            let phase = Phase::of(current);
            match self.table.next(phase, Trigger::Install) {
                Some(_) => {
                    ignored = None;
                    Update::Set(record.clone())
                }
                None => {
                    ignored = Some(phase);
                    Update::Keep
                }
            }
        });

        match (written, ignored) {
            (Ok(_), None) => {
                tracing::debug!(key = %key, node = %self.local, "install requested");
                Ok(op)
            }
            (Ok(_), Some(phase)) => {
                tracing::warn!(key = %key, phase = %phase, "ignoring install");
                self.pending.fail_ticket(&key, ticket, Err(OperationError::Superseded));
                if allocated_here {
                    self.release_quietly(&key);
                }
                Err(StoreError::invalid(format!("{} is {}", key, phase)))
            }
            (Err(e), _) => {
                tracing::warn!(key = %key, error = %e, "install write failed");
                self.pending.fail_ticket(&key, ticket, Err(e.into()));
                if allocated_here {
                    self.release_quietly(&key);
                }
                Ok(op)
            }
        }
    }

    /// Fail if taking one more identifier would exceed the device's capacity.
    fn check_capacity(&self, device_id: &DeviceId) -> StoreResult<()> {
        if let Some(limit) = self.capabilities.max_resources(device_id)? {
            if self.allocator.in_use(device_id)? >= limit {
                return Err(StoreError::CapacityExceeded {
                    device_id: device_id.clone(),
                    limit,
                });
            }
        }
        Ok(())
    }

    fn remove(&self, key: &ResourceKey) -> PendingOperation {
        let (ticket, op) = self.pending.register(key.clone(), OperationKind::Remove);
        let local = self.local.clone();

        let mut phase = Phase::Absent;
        let mut legal = false;
        let written = self.records.compute(key, &mut |current| {
            phase = Phase::of(current);
            legal = false;
            let Some(record) = current else {
                return Update::Keep;
            };
            match self.table.next(phase, Trigger::Remove) {
                Some(_) if phase == Phase::PendingRemove => {
                    legal = true;
                    Update::Keep
                }
                Some(to) => {
                    legal = true;
                    let mut next = record.clone();
                    next.state = to.state().unwrap_or(LifecycleState::PendingRemove);
                    next.reason = None;
                    next.origin = local.clone();
                    Update::Set(next)
                }
                None => Update::Keep,
            }
        });

        if let Err(e) = written {
            tracing::warn!(key = %key, error = %e, "remove write failed");
            self.pending.fail_ticket(key, ticket, Err(e.into()));
            return op;
        }

        match phase {
            Phase::Absent => {
                tracing::debug!(key = %key, "remove of absent resource");
                self.pending.fail_ticket(key, ticket, Ok(()));
            }
            // The entry's deletion resolves us.
            Phase::Removed => {
                tracing::debug!(key = %key, "remove joined tombstone");
            }
            _ if legal => {
                tracing::debug!(key = %key, node = %self.local, "remove requested");
            }
            _ => {
                tracing::warn!(key = %key, phase = %phase, "ignoring remove");
                self.pending.fail_ticket(
                    key,
                    ticket,
                    Err(OperationError::Invalid {
                        message: format!("cannot remove {} while {}", key, phase),
                    }),
                );
            }
        }
        op
    }

    /// Run a device trigger through the table as one atomic compute.
    fn apply(
        &self,
        key: &ResourceKey,
        trigger: Trigger,
        mutate: impl Fn(&mut StateRecord, Phase),
    ) -> StoreResult<Applied> {
        let mut outcome = Applied::Absent;
        let result = self.records.compute_if_present(key, &mut |record| {
            let phase = Phase::of(Some(record));
            match self.table.next(phase, trigger) {
                Some(to) => {
                    let mut next = record.clone();
                    mutate(&mut next, to);
                    outcome = Applied::Written(phase, None);
                    Update::Set(next)
                }
                None => {
                    outcome = Applied::Ignored(phase);
                    Update::Keep
                }
            }
        })?;

        Ok(match outcome {
            Applied::Written(before, _) => Applied::Written(before, result.map(|v| v.value)),
            other => other,
        })
    }

    fn purge(&self, key: &ResourceKey) -> StoreResult<bool> {
        let Some(removed) = self.records.remove(key)? else {
            return Ok(false);
        };
        let record = removed.value;
        self.release_quietly(key);
        tracing::info!(key = %key, state = %record.state, "record purged");
        self.bus
            .post(LifecycleEvent::new(LifecycleEventType::Removed, record));
        Ok(true)
    }

    fn release_quietly(&self, key: &ResourceKey) {
        if let Err(e) = self.allocator.release(&key.device_id, key.id) {
            tracing::warn!(key = %key, error = %e, "failed to release identifier");
        }
    }

    fn on_record_event(&self, event: &MapEvent<ResourceKey, StateRecord>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let key = &event.key;

        if event.event_type == MapEventType::Remove {
            let resolved = self.pending.complete_any(key, |kind| match kind {
                OperationKind::Remove => Ok(()),
                OperationKind::Install => Err(OperationError::Purged),
            });
            if let Some(kind) = resolved {
                tracing::debug!(key = %key, kind = %kind, "pending operation resolved by deletion");
            }
            return;
        }

        let Some(record) = event.new_value.as_ref().map(|v| &v.value) else {
            return;
        };
        let before = Phase::of(event.old_value.as_ref().map(|v| &v.value));
        let after = Phase::of(Some(record));
        if before == after {
            return;
        }
        let is_origin = record.is_origin(&self.local);

        match after {
            Phase::PendingAdd => {
                self.post(LifecycleEventType::AddRequested, record);
            }
            Phase::PendingAddFailed => {
                let reason = record.reason.unwrap_or(FailReason::Unknown);
                self.pending.complete(
                    key,
                    OperationKind::Install,
                    Err(OperationError::DeviceRejected { reason }),
                );
            }
            Phase::Added => {
                self.pending.complete(key, OperationKind::Install, Ok(()));
                if is_origin {
                    self.post(LifecycleEventType::Added, record);
                }
            }
            Phase::PendingRemove => {
                if !is_origin {
                    self.pending
                        .complete(key, OperationKind::Install, Err(OperationError::Superseded));
                }
                self.post(LifecycleEventType::RemoveRequested, record);
            }
            Phase::PendingRemoveFailed => {
                let reason = record.reason.unwrap_or(FailReason::Unknown);
                self.pending.complete(
                    key,
                    OperationKind::Remove,
                    Err(OperationError::DeviceRejected { reason }),
                );
            }
            Phase::Removed => {
                if is_origin {
                    self.consume_tombstone(record);
                }
            }
            Phase::Absent => {}
        }
    }

    fn consume_tombstone(&self, record: &StateRecord) {
        let key = &record.key;
        let mut consumed = false;
        let result = self.records.compute_if_present(key, &mut |current| {
            consumed = current.state == LifecycleState::Removed;
            if consumed {
                Update::Remove
            } else {
                Update::Keep
            }
        });

        if let Err(e) = result {
            tracing::error!(key = %key, error = %e, "failed to delete removal tombstone");
            self.pending
                .complete(key, OperationKind::Remove, Err(e.into()));
            return;
        }
        if !consumed {
            return;
        }

        self.release_quietly(key);
        self.pending.complete(key, OperationKind::Remove, Ok(()));
        self.post(LifecycleEventType::Removed, record);
    }

    fn post(&self, event_type: LifecycleEventType, record: &StateRecord) {
        self.bus
            .post(LifecycleEvent::new(event_type, record.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryCluster;
    use crate::store::record::{AppId, MeterUnit};

    fn descriptor(device: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(
            DeviceId::new(device),
            AppId::new("test"),
            MeterUnit::KbPerSec,
            10,
        )
    }

    #[test]
    fn shutdown_deregisters_watcher() {
        let cluster = InMemoryCluster::new();
        let node = cluster.join(NodeId::new("n1"));
        let coordinator = LifecycleCoordinator::on_node(&node, StoreOptions::default());
        assert_eq!(cluster.listener_count(RECORD_MAP), 1);

        coordinator.shutdown();
        coordinator.shutdown();
        assert_eq!(cluster.listener_count(RECORD_MAP), 0);
        assert!(coordinator.is_shut_down());
    }

    #[tokio::test]
    async fn shutdown_fails_pending_operations() {
        let cluster = InMemoryCluster::new();
        let node = cluster.join(NodeId::new("n1"));
        let coordinator = LifecycleCoordinator::on_node(&node, StoreOptions::default());

        let op = coordinator.install(descriptor("of:1")).unwrap();
        assert_eq!(coordinator.pending_count(), 1);
        coordinator.shutdown();

        assert_eq!(op.await, Err(OperationError::Shutdown));
        let late = coordinator.install(descriptor("of:1")).unwrap();
        assert_eq!(late.await, Err(OperationError::Shutdown));
    }

    #[test]
    fn index_rejected_without_user_defined_mode() {
        let cluster = InMemoryCluster::new();
        let node = cluster.join(NodeId::new("n1"));
        let coordinator = LifecycleCoordinator::on_node(&node, StoreOptions::default());

        let err = coordinator
            .install(descriptor("of:1").with_index(3))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidResource { .. }));
        assert_eq!(cluster.write_count(RECORD_MAP), 0);
    }
}
