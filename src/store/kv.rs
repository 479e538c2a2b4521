//! Typed façade over the distributed key-value store
//!
//! Values are serde_json payloads carrying a per-key monotone version for
//! optimistic concurrency. Reads may come from the local cache; a remote
//! node's cached read may be briefly stale, but a node never resolves a
//! key to a version older than what it last wrote itself (its own writes
//! update its cache synchronously, and invalidations are versioned).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::trace;

use crate::cluster::rpc::Rpc;
use crate::cluster::NodeHandle;
use crate::error::{ChunkflowError, ChunkflowResult};
use crate::job::JobId;
use crate::store::key::Key;

/// Retry backoff cap for `atomic_update` conflicts
const MAX_BACKOFF: Duration = Duration::from_millis(64);

/// A stored payload plus its commit version
#[derive(Debug, Clone)]
pub(crate) struct Versioned {
    pub version: u64,
    pub bytes: Arc<Vec<u8>>,
}

impl NodeHandle {
    /// Publish `value` under `key`; returns the committed version
    pub async fn put<T: Serialize + ?Sized>(&self, key: &Key, value: &T) -> ChunkflowResult<u64> {
        let bytes = Arc::new(serde_json::to_vec(value)?);
        let home = key.home_node(self.n_nodes());
        let (tx, rx) = oneshot::channel();
        self.send(
            home,
            Rpc::Put {
                key: key.clone(),
                bytes: bytes.clone(),
                reply: tx,
            },
        )?;
        let version = rx
            .await
            .map_err(|_| ChunkflowError::ClusterDown { node: home })?;
        // Read-your-writes: keep the committed version locally
        self.shared
            .cache_put(key.clone(), Versioned { version, bytes })
            .await;
        Ok(version)
    }

    /// Fetch the value under `key`, or `None` if absent
    pub async fn get<T: DeserializeOwned>(&self, key: &Key) -> ChunkflowResult<Option<T>> {
        match self.fetch(key, true).await? {
            Some(v) => Ok(Some(serde_json::from_slice(&v.bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch a value that is expected to exist
    pub async fn get_required<T: DeserializeOwned>(&self, key: &Key) -> ChunkflowResult<T> {
        self.get(key)
            .await?
            .ok_or_else(|| ChunkflowError::KeyNotFound { key: key.clone() })
    }

    /// Remove `key` from the store. Fails with an in-use error if another
    /// job holds the write lock.
    pub async fn remove(&self, key: &Key) -> ChunkflowResult<bool> {
        self.remove_impl(key, None).await
    }

    /// Remove `key` on behalf of `job`, permitted when `job` itself holds
    /// the write lock
    pub async fn remove_as(&self, key: &Key, job: &JobId) -> ChunkflowResult<bool> {
        self.remove_impl(key, Some(job.clone())).await
    }

    async fn remove_impl(&self, key: &Key, requester: Option<JobId>) -> ChunkflowResult<bool> {
        let home = key.home_node(self.n_nodes());
        let (tx, rx) = oneshot::channel();
        self.send(
            home,
            Rpc::Remove {
                key: key.clone(),
                requester,
                reply: tx,
            },
        )?;
        let removed = rx
            .await
            .map_err(|_| ChunkflowError::ClusterDown { node: home })??;
        if removed {
            self.shared.cache_evict(key).await;
        }
        Ok(removed)
    }

    /// Atomically transform the value under `key`. The transform sees the
    /// latest committed value (or absence) and its result is published
    /// only if no conflicting write landed in between; on conflict the
    /// transform is re-run against the fresh value. Unbounded optimistic
    /// retry with exponential backoff and jitter, capped at 64ms.
    pub async fn atomic_update<T, F>(&self, key: &Key, mut transform: F) -> ChunkflowResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> T,
    {
        let home = key.home_node(self.n_nodes());
        let mut delay = Duration::from_millis(1);
        loop {
            let current = self.fetch(key, false).await?;
            let expected = current.as_ref().map(|v| v.version);
            let value = match &current {
                Some(v) => Some(serde_json::from_slice::<T>(&v.bytes)?),
                None => None,
            };
            let next = transform(value);
            let bytes = Arc::new(serde_json::to_vec(&next)?);
            let (tx, rx) = oneshot::channel();
            self.send(
                home,
                Rpc::CompareAndPut {
                    key: key.clone(),
                    expected,
                    bytes: bytes.clone(),
                    reply: tx,
                },
            )?;
            match rx
                .await
                .map_err(|_| ChunkflowError::ClusterDown { node: home })?
            {
                Ok(version) => {
                    self.shared
                        .cache_put(key.clone(), Versioned { version, bytes })
                        .await;
                    return Ok(next);
                }
                Err(winner) => {
                    trace!(key = %key, ?expected, ?winner, "atomic update lost the race, retrying");
                    let jitter = rand::rng().random_range(0..=delay.as_millis() as u64);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Take the write lock on `key` for `job`; fails if another job holds it
    pub async fn lock_for_write(&self, key: &Key, job: &JobId) -> ChunkflowResult<()> {
        let home = key.home_node(self.n_nodes());
        let (tx, rx) = oneshot::channel();
        self.send(
            home,
            Rpc::Lock {
                key: key.clone(),
                job: job.clone(),
                reply: tx,
            },
        )?;
        rx.await
            .map_err(|_| ChunkflowError::ClusterDown { node: home })?
    }

    /// Release the write lock held by `job`
    pub async fn unlock(&self, key: &Key, job: &JobId) -> ChunkflowResult<()> {
        let home = key.home_node(self.n_nodes());
        let (tx, rx) = oneshot::channel();
        self.send(
            home,
            Rpc::Unlock {
                key: key.clone(),
                job: job.clone(),
                reply: tx,
            },
        )?;
        rx.await
            .map_err(|_| ChunkflowError::ClusterDown { node: home })?
    }

    /// Fire-and-forget release of every lock `job` still holds anywhere
    pub(crate) fn release_job_locks_everywhere(&self, job: &JobId) {
        for node in 0..self.n_nodes() {
            let _ = self.send(node, Rpc::ReleaseJob { job: job.clone() });
        }
    }

    /// Resolve `key` to its versioned payload. Local keys come straight
    /// off the shard; remote keys go through the read-through cache unless
    /// `use_cache` is false (the atomic-update path needs the latest).
    pub(crate) async fn fetch(&self, key: &Key, use_cache: bool) -> ChunkflowResult<Option<Versioned>> {
        let home = key.home_node(self.n_nodes());
        if home == self.id() {
            return Ok(self.shared.shard_get(key).await);
        }
        if use_cache {
            if let Some(hit) = self.shared.cache_get(key).await {
                trace!(key = %key, version = hit.version, "cache hit");
                return Ok(Some(hit));
            }
        }
        let (tx, rx) = oneshot::channel();
        self.send(home, Rpc::Get { key: key.clone(), reply: tx })?;
        let fetched = rx
            .await
            .map_err(|_| ChunkflowError::ClusterDown { node: home })?;
        if let Some(v) = &fetched {
            self.shared.cache_put(key.clone(), v.clone()).await;
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use crate::cluster::Cluster;
    use crate::job::JobId;
    use crate::store::key::Key;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        hits: u64,
    }

    #[tokio::test]
    async fn put_get_remove_round_trip() {
        let cluster = Cluster::launch(3).unwrap();
        let node = cluster.node(0);
        let key = Key::random("counters");

        node.put(&key, &Counter { hits: 7 }).await.unwrap();
        let got: Option<Counter> = node.get(&key).await.unwrap();
        assert_eq!(got, Some(Counter { hits: 7 }));

        assert!(node.remove(&key).await.unwrap());
        let gone: Option<Counter> = node.get(&key).await.unwrap();
        assert_eq!(gone, None);
        assert!(!node.remove(&key).await.unwrap());
    }

    #[tokio::test]
    async fn versions_are_monotone_per_key() {
        let cluster = Cluster::launch(2).unwrap();
        let node = cluster.node(1);
        let key = Key::random("v");

        let v1 = node.put(&key, &Counter { hits: 1 }).await.unwrap();
        let v2 = node.put(&key, &Counter { hits: 2 }).await.unwrap();
        assert!(v2 > v1);

        // Versions do not reset when a key is removed and re-created, so
        // cached copies of the old incarnation stay distinguishable
        assert!(node.remove(&key).await.unwrap());
        let v3 = node.put(&key, &Counter { hits: 3 }).await.unwrap();
        assert!(v3 > v2);
    }

    #[tokio::test]
    async fn writer_reads_its_own_write_from_any_node() {
        let cluster = Cluster::launch(4).unwrap();
        let key = Key::random("shared");
        for round in 0..8u64 {
            let writer = cluster.node((round % 4) as usize);
            writer.put(&key, &Counter { hits: round }).await.unwrap();
            let read: Counter = writer.get_required(&key).await.unwrap();
            assert_eq!(read.hits, round);
        }
    }

    #[tokio::test]
    async fn atomic_update_sees_latest_and_commits() {
        let cluster = Cluster::launch(2).unwrap();
        let node = cluster.node(0);
        let key = Key::random("acc");

        let first = node
            .atomic_update(&key, |cur: Option<Counter>| {
                assert!(cur.is_none());
                Counter { hits: 1 }
            })
            .await
            .unwrap();
        assert_eq!(first.hits, 1);

        let second = node
            .atomic_update(&key, |cur: Option<Counter>| Counter {
                hits: cur.map(|c| c.hits).unwrap_or(0) + 1,
            })
            .await
            .unwrap();
        assert_eq!(second.hits, 2);
    }

    #[tokio::test]
    async fn concurrent_atomic_updates_lose_no_increments() {
        let cluster = Cluster::launch(3).unwrap();
        let key = Key::random("hot");
        const WRITERS: usize = 12;

        let mut joins = Vec::new();
        for w in 0..WRITERS {
            let node = cluster.node(w % 3);
            let key = key.clone();
            joins.push(tokio::spawn(async move {
                node.atomic_update(&key, |cur: Option<Counter>| Counter {
                    hits: cur.map(|c| c.hits).unwrap_or(0) + 1,
                })
                .await
                .unwrap();
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        let total: Counter = cluster.node(0).get_required(&key).await.unwrap();
        assert_eq!(total.hits, WRITERS as u64);
    }

    #[tokio::test]
    async fn remove_of_locked_key_fails_for_other_jobs() {
        let cluster = Cluster::launch(2).unwrap();
        let node = cluster.node(0);
        let key = Key::random("model");
        let (owner, intruder) = (JobId::new(), JobId::new());

        node.put(&key, &Counter { hits: 1 }).await.unwrap();
        node.lock_for_write(&key, &owner).await.unwrap();

        let err = node.remove(&key).await.unwrap_err();
        assert!(err.is_lock_conflict(), "expected in-use error, got {err}");
        let err = node.remove_as(&key, &intruder).await.unwrap_err();
        assert!(err.is_lock_conflict());

        // The holder itself may structurally mutate
        assert!(node.remove_as(&key, &owner).await.unwrap());
    }
}
