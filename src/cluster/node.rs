//! Node state and the per-node actor loop
//!
//! Each node owns three things: the shard of the key-value store homed on
//! it, a read-through cache of remote keys, and the write-lock table for
//! its keys. All mutations of that state flow through the node's request
//! channel, so the home node observes its own writes in program order and
//! compare-and-put is race-free without per-key locking.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, trace};

use super::rpc::Rpc;
use super::{ClusterConfig, NodeId};
use crate::error::{ChunkflowError, ChunkflowResult};
use crate::job::JobId;
use crate::store::key::Key;
use crate::store::kv::Versioned;
use crate::store::lock::LockTable;

pub(crate) struct NodeState {
    pub id: NodeId,
    pub n_nodes: usize,
    pub config: ClusterConfig,
    shard: RwLock<Shard>,
    cache: Mutex<LruCache<Key, CacheSlot>>,
    locks: Mutex<LockTable>,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<Key, Versioned>,
    /// Last committed version per key. Never reset, even across removals,
    /// so commit versions stay monotone for the lifetime of the node and
    /// cache version floors remain valid after a key is re-created.
    versions: HashMap<Key, u64>,
}

impl Shard {
    fn next_version(&mut self, key: &Key) -> u64 {
        let counter = self.versions.entry(key.clone()).or_insert(0);
        *counter += 1;
        *counter
    }
}

/// Cached view of one remote key. The floor is the lowest version still
/// acceptable; it outlives the value, so an invalidation that arrives
/// before a slow remote fill completes still wins over the fill.
#[derive(Debug, Default)]
struct CacheSlot {
    floor: u64,
    value: Option<Versioned>,
}

impl NodeState {
    pub fn new(id: NodeId, n_nodes: usize, config: ClusterConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            id,
            n_nodes,
            config,
            shard: RwLock::new(Shard::default()),
            cache: Mutex::new(LruCache::new(capacity)),
            locks: Mutex::new(LockTable::default()),
        }
    }

    pub async fn shard_get(&self, key: &Key) -> Option<Versioned> {
        self.shard.read().await.entries.get(key).cloned()
    }

    /// Commit a write; the version counter is monotone per key
    pub async fn shard_put(&self, key: Key, bytes: Arc<Vec<u8>>) -> u64 {
        let mut shard = self.shard.write().await;
        let version = shard.next_version(&key);
        shard.entries.insert(key, Versioned { version, bytes });
        version
    }

    pub async fn shard_cas(
        &self,
        key: Key,
        expected: Option<u64>,
        bytes: Arc<Vec<u8>>,
    ) -> Result<u64, Option<u64>> {
        let mut shard = self.shard.write().await;
        let current = shard.entries.get(&key).map(|v| v.version);
        if current != expected {
            return Err(current);
        }
        let version = shard.next_version(&key);
        shard.entries.insert(key, Versioned { version, bytes });
        Ok(version)
    }

    /// Remove with the lock check: a key write-locked by another job must
    /// surface an explicit in-use error rather than racing its readers.
    pub async fn remove_checked(
        &self,
        key: &Key,
        requester: Option<&JobId>,
    ) -> ChunkflowResult<bool> {
        self.locks
            .lock()
            .await
            .permits(key, requester)
            .map_err(|holder| ChunkflowError::ObjectInUse {
                key: key.clone(),
                holder,
            })?;
        Ok(self.shard.write().await.entries.remove(key).is_some())
    }

    pub async fn lock_for_write(&self, key: Key, job: JobId) -> ChunkflowResult<()> {
        self.locks
            .lock()
            .await
            .lock(key.clone(), job)
            .map_err(|holder| ChunkflowError::LockViolation { key, holder })
    }

    pub async fn unlock(&self, key: Key, job: &JobId) -> ChunkflowResult<()> {
        self.locks
            .lock()
            .await
            .unlock(&key, job)
            .map_err(|holder| ChunkflowError::LockViolation { key, holder })
    }

    pub async fn release_job_locks(&self, job: &JobId) -> usize {
        self.locks.lock().await.release_job(job)
    }

    pub async fn cache_get(&self, key: &Key) -> Option<Versioned> {
        self.cache
            .lock()
            .await
            .get(key)
            .and_then(|slot| slot.value.clone())
    }

    /// Cache a remote key's value; keys homed here are never cached, the
    /// shard is authoritative for them. A fill below the key's invalidation
    /// floor, or older than what is already cached, is dropped: it raced a
    /// newer write and would otherwise stay stale until the write after next.
    pub async fn cache_put(&self, key: Key, value: Versioned) {
        if key.home_node(self.n_nodes) == self.id {
            return;
        }
        let mut cache = self.cache.lock().await;
        let slot = cache.get_or_insert_mut(key, CacheSlot::default);
        if value.version < slot.floor {
            return;
        }
        if slot
            .value
            .as_ref()
            .map(|v| v.version >= value.version)
            .unwrap_or(false)
        {
            return;
        }
        slot.value = Some(value);
    }

    /// Record the invalidating version as the key's new floor and drop any
    /// older cached value. The floor is recorded even when nothing is
    /// cached yet, so a fill still in flight cannot land stale. A node that
    /// wrote the key itself already caches the new version and keeps it, so
    /// it never reads older than its own last write.
    pub async fn cache_invalidate(&self, key: &Key, version: u64) {
        let mut cache = self.cache.lock().await;
        let slot = cache.get_or_insert_mut(key.clone(), CacheSlot::default);
        slot.floor = slot.floor.max(version);
        if slot
            .value
            .as_ref()
            .map(|v| v.version < version)
            .unwrap_or(false)
        {
            slot.value = None;
        }
    }

    /// Drop the cached value after a removal; the floor moves past it so a
    /// racing fill cannot resurrect the removed payload
    pub async fn cache_evict(&self, key: &Key) {
        if let Some(slot) = self.cache.lock().await.get_mut(key) {
            if let Some(v) = &slot.value {
                slot.floor = slot.floor.max(v.version + 1);
            }
            slot.value = None;
        }
    }
}

/// Cheap, cloneable view of one node, used by everything that runs "on"
/// that node: the KV façade, chunk materialization, and the task runner.
#[derive(Clone)]
pub struct NodeHandle {
    pub(crate) shared: Arc<NodeState>,
    pub(crate) peers: Arc<Vec<mpsc::UnboundedSender<Rpc>>>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    pub fn n_nodes(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn grain(&self) -> usize {
        self.shared.config.task_grain.max(1)
    }

    pub(crate) fn send(&self, node: NodeId, msg: Rpc) -> ChunkflowResult<()> {
        let sender = self
            .peers
            .get(node)
            .ok_or(ChunkflowError::ClusterDown { node })?;
        sender
            .send(msg)
            .map_err(|_| ChunkflowError::ClusterDown { node })
    }
}

pub(crate) fn broadcast(peers: &[mpsc::UnboundedSender<Rpc>], skip: NodeId, mut make: impl FnMut() -> Rpc) {
    for (id, peer) in peers.iter().enumerate() {
        if id != skip {
            // A closed peer channel just means that node is gone; the
            // staleness window covers its cache.
            let _ = peer.send(make());
        }
    }
}

/// Per-node actor loop. Exits when every handle to the node is dropped.
pub(crate) async fn run_node(
    state: Arc<NodeState>,
    peers: Arc<Vec<mpsc::UnboundedSender<Rpc>>>,
    mut rx: mpsc::UnboundedReceiver<Rpc>,
) {
    debug!(node = state.id, "node actor started");
    while let Some(msg) = rx.recv().await {
        match msg {
            Rpc::Get { key, reply } => {
                let _ = reply.send(state.shard_get(&key).await);
            }
            Rpc::Put { key, bytes, reply } => {
                let version = state.shard_put(key.clone(), bytes).await;
                trace!(node = state.id, key = %key, version, "put committed");
                broadcast(&peers, state.id, || Rpc::Invalidate {
                    key: key.clone(),
                    version,
                });
                let _ = reply.send(version);
            }
            Rpc::CompareAndPut {
                key,
                expected,
                bytes,
                reply,
            } => {
                let outcome = state.shard_cas(key.clone(), expected, bytes).await;
                if let Ok(version) = outcome {
                    broadcast(&peers, state.id, || Rpc::Invalidate {
                        key: key.clone(),
                        version,
                    });
                }
                let _ = reply.send(outcome);
            }
            Rpc::Remove {
                key,
                requester,
                reply,
            } => {
                let outcome = state.remove_checked(&key, requester.as_ref()).await;
                if matches!(outcome, Ok(true)) {
                    broadcast(&peers, state.id, || Rpc::Evict { key: key.clone() });
                }
                let _ = reply.send(outcome);
            }
            Rpc::Lock { key, job, reply } => {
                let _ = reply.send(state.lock_for_write(key, job).await);
            }
            Rpc::Unlock { key, job, reply } => {
                let _ = reply.send(state.unlock(key, &job).await);
            }
            Rpc::ReleaseJob { job } => {
                let released = state.release_job_locks(&job).await;
                if released > 0 {
                    debug!(node = state.id, job = %job, released, "released leftover write locks");
                }
            }
            Rpc::Invalidate { key, version } => {
                state.cache_invalidate(&key, version).await;
            }
            Rpc::Evict { key } => {
                state.cache_evict(&key).await;
            }
            Rpc::RunTask(req) => {
                // Long-running compute must not block the actor loop
                let handle = NodeHandle {
                    shared: state.clone(),
                    peers: peers.clone(),
                };
                tokio::spawn(async move {
                    let result = crate::exec::local::run_tree(
                        handle,
                        req.task,
                        Arc::new(req.columns),
                        req.ordinals,
                        req.stop,
                    )
                    .await;
                    let _ = req.reply.send(result);
                });
            }
        }
    }
    trace!(node = state.id, "node actor stopped");
}
