//! # Chunkflow
//!
//! A distributed, data-parallel execution substrate. Higher-level
//! algorithms (model builders, scoring, column statistics) are written as
//! small map/reduce tasks over partitioned columnar data; the substrate
//! handles everything else.
//!
//! ## Modules
//!
//! - `cluster` - In-process cluster of node actors joined by message-passing RPC
//! - `store` - Distributed key-value store: hash-routed keys, per-node caching, atomic updates, write locks
//! - `frame` - Partitioned columnar data model: frames, columns, keyed chunks
//! - `exec` - Chunk-parallel execution framework with fork-join local reduction and cluster fan-out
//! - `job` - Cancellable, observable jobs plus stack-discipline scope cleanup
//! - `builder` - Reference iterative model builder exercising the whole substrate
//! - `error` - Crate-wide error taxonomy

pub mod builder;
pub mod cluster;
pub mod error;
pub mod exec;
pub mod frame;
pub mod job;
pub mod store;

pub use cluster::{Cluster, ClusterConfig, NodeHandle, NodeId};
pub use error::{ChunkflowError, ChunkflowResult};
pub use exec::{run_over, run_over_cancellable, run_over_columns, ChunkTask};
pub use frame::{ChunkData, Column, Frame, RowLayout};
pub use job::{JobHandle, JobId, JobState, Scope, StopToken};
pub use store::Key;
