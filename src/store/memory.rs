//! In-memory cluster implementation of [`ReplicatedMap`].
//!
//! Every node that joins an [`InMemoryCluster`] opens typed clients onto the
//! same named maps. Keys and values cross the "wire" as bincode-encoded
//! [`Bytes`] and are decoded per node, so listeners on different nodes never
//! share value instances.
//!
//! Writes append their change event to a per-map queue while still holding
//! the map lock, which fixes the delivery order to the commit order. The
//! queue is drained after the lock is released by whichever caller finds no
//! drain in progress; a listener that writes back to the map from inside its
//! handler only enqueues, and the outer drain delivers the nested event next.

use crate::control::mastership::NodeId;
use crate::core::error::{StoreError, StoreResult};
use crate::store::map::{
    ListenerId, MapEvent, MapEventType, MapListener, ReplicatedMap, Update, Versioned,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type EventSink = Arc<dyn Fn(&RawEvent) + Send + Sync>;

/// Encoded change event as queued by the writer.
#[derive(Debug, Clone)]
struct RawEvent {
    event_type: MapEventType,
    key: Bytes,
    new_value: Option<Versioned<Bytes>>,
    old_value: Option<Versioned<Bytes>>,
}

struct RegisteredListener {
    id: ListenerId,
    node_id: NodeId,
    sink: EventSink,
}

#[derive(Default)]
struct MapState {
    entries: BTreeMap<Bytes, Versioned<Bytes>>,
    version: u64,
    queue: VecDeque<RawEvent>,
}

/// Cluster-wide backing of one named map.
struct SharedMap {
    name: String,
    state: Mutex<MapState>,
    listeners: Mutex<Vec<RegisteredListener>>,
    draining: AtomicBool,
}

impl SharedMap {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MapState::default()),
            listeners: Mutex::new(Vec::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Deliver queued events until the queue is empty.
    fn drain(&self) {
        loop {
            if self.draining.swap(true, Ordering::AcqRel) {
                return;
            }

            loop {
                let next = self.state.lock().queue.pop_front();
                let Some(event) = next else {
                    break;
                };
                let sinks: Vec<EventSink> = self
                    .listeners
                    .lock()
                    .iter()
                    .map(|l| Arc::clone(&l.sink))
                    .collect();
                for sink in sinks {
                    sink(&event);
                }
            }

            self.draining.store(false, Ordering::Release);

            // A writer may have enqueued between our last pop and the flag reset.
            if self.state.lock().queue.is_empty() {
                return;
            }
        }
    }
}

struct ClusterInner {
    available: AtomicBool,
    maps: Mutex<HashMap<String, Arc<SharedMap>>>,
    members: Mutex<Vec<NodeId>>,
    next_listener: AtomicU64,
}

/// A simulated cluster of nodes sharing replicated maps.
#[derive(Clone)]
pub struct InMemoryCluster {
    inner: Arc<ClusterInner>,
}

impl InMemoryCluster {
    /// Create an empty, available cluster.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                available: AtomicBool::new(true),
                maps: Mutex::new(HashMap::new()),
                members: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Add a node to the cluster and get its handle.
    pub fn join(&self, node_id: NodeId) -> ClusterNode {
        let mut members = self.inner.members.lock();
        if !members.contains(&node_id) {
            members.push(node_id.clone());
        }
        tracing::debug!(node = %node_id, "node joined in-memory cluster");
        ClusterNode {
            cluster: self.clone(),
            node_id,
        }
    }

    /// Remove a node from the membership list.
    pub fn leave(&self, node_id: &NodeId) -> bool {
        let mut members = self.inner.members.lock();
        let before = members.len();
        members.retain(|m| m != node_id);
        if members.len() != before {
            tracing::debug!(node = %node_id, "node left in-memory cluster");
            true
        } else {
            false
        }
    }

    /// Nodes that joined the cluster.
    pub fn members(&self) -> Vec<NodeId> {
        self.inner.members.lock().clone()
    }

    /// Simulate quorum loss (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
        if available {
            tracing::info!("in-memory cluster available");
        } else {
            tracing::warn!("in-memory cluster lost quorum");
        }
    }

    /// Check if the cluster accepts operations.
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    /// Number of writes committed to a map so far.
    pub fn write_count(&self, map_name: &str) -> u64 {
        self.inner
            .maps
            .lock()
            .get(map_name)
            .map(|m| m.state.lock().version)
            .unwrap_or(0)
    }

    /// Number of listeners registered on a map across all nodes.
    pub fn listener_count(&self, map_name: &str) -> usize {
        self.inner
            .maps
            .lock()
            .get(map_name)
            .map(|m| m.listeners.lock().len())
            .unwrap_or(0)
    }

    fn shared(&self, name: &str) -> Arc<SharedMap> {
        let mut maps = self.inner.maps.lock();
        Arc::clone(
            maps.entry(name.to_string())
                .or_insert_with(|| Arc::new(SharedMap::new(name))),
        )
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of an [`InMemoryCluster`].
#[derive(Clone)]
pub struct ClusterNode {
    cluster: InMemoryCluster,
    node_id: NodeId,
}

impl ClusterNode {
    /// Identity of this node.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The cluster this node belongs to.
    pub fn cluster(&self) -> &InMemoryCluster {
        &self.cluster
    }

    /// Open a typed client onto a named map.
    pub fn map<K, V>(&self, name: &str) -> InMemoryMap<K, V>
    where
        K: Serialize + DeserializeOwned + Send + Sync + 'static,
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        InMemoryMap {
            shared: self.cluster.shared(name),
            cluster: Arc::clone(&self.cluster.inner),
            node_id: self.node_id.clone(),
            registered: Mutex::new(Vec::new()),
            _marker: PhantomData,
        }
    }
}

/// Typed client of a replicated map, owned by one node.
///
/// Listeners registered through a client are deregistered when it drops.
pub struct InMemoryMap<K, V> {
    shared: Arc<SharedMap>,
    cluster: Arc<ClusterInner>,
    node_id: NodeId,
    registered: Mutex<Vec<ListenerId>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

fn encode<T: Serialize>(map: &str, value: &T) -> StoreResult<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| StoreError::storage(format!("map {}: encode failed: {}", map, e)))
}

fn decode<T: DeserializeOwned>(map: &str, bytes: &Bytes) -> StoreResult<T> {
    bincode::deserialize(bytes)
        .map_err(|e| StoreError::storage(format!("map {}: decode failed: {}", map, e)))
}

fn decode_versioned<T: DeserializeOwned>(
    map: &str,
    raw: &Option<Versioned<Bytes>>,
) -> StoreResult<Option<Versioned<T>>> {
    match raw {
        Some(v) => Ok(Some(Versioned::new(decode(map, &v.value)?, v.version))),
        None => Ok(None),
    }
}

impl<K, V> InMemoryMap<K, V>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Node that owns this client.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.cluster.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::storage(format!(
                "map {} unavailable: quorum lost",
                self.shared.name
            )))
        }
    }

    /// Apply an update under the map lock, returning (old, new).
    fn apply(
        &self,
        key: &K,
        f: &mut dyn FnMut(Option<&V>) -> Update<V>,
    ) -> StoreResult<(Option<Versioned<V>>, Option<Versioned<V>>)> {
        self.check_available()?;
        let name = self.shared.name.as_str();
        let key_bytes = encode(name, key)?;

        let outcome = {
            let mut state = self.shared.state.lock();
            let current: Option<Versioned<V>> =
                decode_versioned(name, &state.entries.get(&key_bytes).cloned())?;

            match f(current.as_ref().map(|v| &v.value)) {
                Update::Keep => (current.clone(), current),
                Update::Set(value) => {
                    let encoded = encode(name, &value)?;
                    state.version += 1;
                    let version = state.version;
                    let stored = Versioned::new(encoded, version);
                    let old_raw = state.entries.insert(key_bytes.clone(), stored.clone());
                    let event_type = if old_raw.is_some() {
                        MapEventType::Update
                    } else {
                        MapEventType::Insert
                    };
                    state.queue.push_back(RawEvent {
                        event_type,
                        key: key_bytes,
                        new_value: Some(stored),
                        old_value: old_raw,
                    });
                    (current, Some(Versioned::new(value, version)))
                }
                Update::Remove => {
                    if let Some(old_raw) = state.entries.remove(&key_bytes) {
                        state.version += 1;
                        state.queue.push_back(RawEvent {
                            event_type: MapEventType::Remove,
                            key: key_bytes,
                            new_value: None,
                            old_value: Some(old_raw),
                        });
                    }
                    (current, None)
                }
            }
        };

        self.shared.drain();
        Ok(outcome)
    }
}

impl<K, V> ReplicatedMap<K, V> for InMemoryMap<K, V>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn get(&self, key: &K) -> StoreResult<Option<Versioned<V>>> {
        self.check_available()?;
        let name = self.shared.name.as_str();
        let key_bytes = encode(name, key)?;
        let raw = self.shared.state.lock().entries.get(&key_bytes).cloned();
        decode_versioned(name, &raw)
    }

    fn put(&self, key: K, value: V) -> StoreResult<Option<Versioned<V>>> {
        let mut value = Some(value);
        let (old, _) = self.apply(&key, &mut |_| match value.take() {
            Some(v) => Update::Set(v),
            None => Update::Keep,
        })?;
        Ok(old)
    }

    fn compute(
        &self,
        key: &K,
        f: &mut dyn FnMut(Option<&V>) -> Update<V>,
    ) -> StoreResult<Option<Versioned<V>>> {
        let (_, new) = self.apply(key, f)?;
        Ok(new)
    }

    fn remove(&self, key: &K) -> StoreResult<Option<Versioned<V>>> {
        let (old, _) = self.apply(key, &mut |current| match current {
            Some(_) => Update::Remove,
            None => Update::Keep,
        })?;
        Ok(old)
    }

    fn entries(&self) -> StoreResult<Vec<(K, Versioned<V>)>> {
        self.check_available()?;
        let name = self.shared.name.as_str();
        let raw: Vec<(Bytes, Versioned<Bytes>)> = self
            .shared
            .state
            .lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        raw.into_iter()
            .map(|(k, v)| {
                Ok((
                    decode(name, &k)?,
                    Versioned::new(decode(name, &v.value)?, v.version),
                ))
            })
            .collect()
    }

    fn add_listener(&self, listener: Arc<dyn MapListener<K, V>>) -> ListenerId {
        let id = ListenerId(self.cluster.next_listener.fetch_add(1, Ordering::Relaxed));
        let map_name = self.shared.name.clone();
        let node_id = self.node_id.clone();

        let sink: EventSink = Arc::new(move |raw: &RawEvent| {
            let decoded = decode::<K>(&map_name, &raw.key).and_then(|key| {
                Ok(MapEvent {
                    map_name: map_name.clone(),
                    event_type: raw.event_type,
                    key,
                    new_value: decode_versioned(&map_name, &raw.new_value)?,
                    old_value: decode_versioned(&map_name, &raw.old_value)?,
                })
            });
            match decoded {
                Ok(event) => listener.event(&event),
                Err(e) => {
                    tracing::error!(map = %map_name, node = %node_id, error = %e, "dropping undecodable map event");
                }
            }
        });

        self.shared.listeners.lock().push(RegisteredListener {
            id,
            node_id: self.node_id.clone(),
            sink,
        });
        self.registered.lock().push(id);
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.registered.lock().retain(|l| *l != id);
        let mut listeners = self.shared.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }
}

impl<K, V> Drop for InMemoryMap<K, V> {
    fn drop(&mut self) {
        let registered = std::mem::take(&mut *self.registered.lock());
        if registered.is_empty() {
            return;
        }
        self.shared
            .listeners
            .lock()
            .retain(|l| !(l.node_id == self.node_id && registered.contains(&l.id)));
    }
}
