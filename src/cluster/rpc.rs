//! RPC messages between nodes
//!
//! Every cross-node interaction is one of these requests on the target
//! node's channel; nodes exchange no other state. Mutations always route
//! to the key's home node, which serializes them through its actor loop.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::ChunkflowResult;
use crate::exec::{AnyPartial, ErasedTask};
use crate::frame::column::Column;
use crate::job::{JobId, StopToken};
use crate::store::key::Key;
use crate::store::kv::Versioned;

pub(crate) enum Rpc {
    /// Authoritative read from the home node's shard
    Get {
        key: Key,
        reply: oneshot::Sender<Option<Versioned>>,
    },
    /// Unconditional write; replies with the committed version
    Put {
        key: Key,
        bytes: Arc<Vec<u8>>,
        reply: oneshot::Sender<u64>,
    },
    /// Optimistic write; commits only if the current version still matches
    /// `expected` (`None` = expect absent). `Err` carries the version that
    /// won the race.
    CompareAndPut {
        key: Key,
        expected: Option<u64>,
        bytes: Arc<Vec<u8>>,
        reply: oneshot::Sender<Result<u64, Option<u64>>>,
    },
    /// Structural removal; fails if another job holds the write lock
    Remove {
        key: Key,
        requester: Option<JobId>,
        reply: oneshot::Sender<ChunkflowResult<bool>>,
    },
    Lock {
        key: Key,
        job: JobId,
        reply: oneshot::Sender<ChunkflowResult<()>>,
    },
    Unlock {
        key: Key,
        job: JobId,
        reply: oneshot::Sender<ChunkflowResult<()>>,
    },
    /// Drop every lock a finished job still holds on this node
    ReleaseJob { job: JobId },
    /// Cache invalidation sent by a home node after a write; evicts only
    /// entries older than `version`
    Invalidate { key: Key, version: u64 },
    /// Cache eviction after a removal
    Evict { key: Key },
    /// Run a chunk task over the ordinals this node owns
    RunTask(TaskRequest),
}

pub(crate) struct TaskRequest {
    pub task: Arc<dyn ErasedTask>,
    pub columns: Vec<Column>,
    pub ordinals: Vec<usize>,
    pub stop: StopToken,
    pub reply: oneshot::Sender<ChunkflowResult<AnyPartial>>,
}
