//! Error types for the distributed substrate
//!
//! Validation errors are raised synchronously before any job starts.
//! Errors inside chunk work are captured with the failing node and cause,
//! aggregated to a single distributed-execution error, and surface at the
//! job level. Lock violations are local and synchronous and never affect
//! the lock holder's running job.

use std::fmt;

use thiserror::Error;

use crate::cluster::NodeId;
use crate::job::JobId;
use crate::store::key::Key;

/// Result type for substrate operations
pub type ChunkflowResult<T> = Result<T, ChunkflowError>;

/// Error taxonomy for the substrate
#[derive(Debug, Error)]
pub enum ChunkflowError {
    /// Bad argument detected before any work started
    #[error("validation failed for '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// A chunk task failed somewhere in the cluster; carries the origin
    /// node and the original cause
    #[error("distributed task failed on node {node}: {reason}")]
    TaskFailed {
        node: NodeId,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cooperative stop observed between reduction steps. Not a failure:
    /// the job layer converts this into the `Cancelled` terminal state.
    #[error("cancelled")]
    Cancelled,

    /// Write lock already held by another job
    #[error("write lock on '{key}' is held by job {holder}")]
    LockViolation { key: Key, holder: JobId },

    /// Structural mutation attempted on an object another job has locked
    #[error("object '{key}' is in use by job {holder}")]
    ObjectInUse { key: Key, holder: JobId },

    /// Expected object is absent from the store
    #[error("key not found: '{key}'")]
    KeyNotFound { key: Key },

    /// Payload could not be (de)serialized through the store
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A node's request channel is closed
    #[error("node {node} is unreachable")]
    ClusterDown { node: NodeId },

    /// Invariant breach inside the substrate itself
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChunkflowError {
    /// Create a validation error
    pub fn validation<F: fmt::Display, R: fmt::Display>(field: F, reason: R) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Wrap a chunk task failure with its origin node
    pub fn task_failed(node: NodeId, cause: anyhow::Error) -> Self {
        Self::TaskFailed {
            node,
            reason: cause.to_string(),
            source: Some(cause.into()),
        }
    }

    /// Create an internal error
    pub fn internal<M: fmt::Display>(msg: M) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Check if this is the cooperative-stop marker
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this is a lock or in-use conflict
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockViolation { .. } | Self::ObjectInUse { .. })
    }

    /// Check if this error originated inside distributed chunk work
    pub fn is_task_failure(&self) -> bool {
        matches!(self, Self::TaskFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failure_keeps_origin_node_and_cause() {
        let err = ChunkflowError::task_failed(2, anyhow::anyhow!("bad chunk"));
        assert!(err.is_task_failure());
        assert!(err.to_string().contains("node 2"));
        assert!(err.to_string().contains("bad chunk"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn predicates_classify_variants() {
        assert!(ChunkflowError::Cancelled.is_cancelled());
        let err = ChunkflowError::LockViolation {
            key: Key::new("k"),
            holder: JobId::new(),
        };
        assert!(err.is_lock_conflict());
        assert!(!err.is_task_failure());
    }
}
