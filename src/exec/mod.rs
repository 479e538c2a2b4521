//! Chunk-parallel execution framework
//!
//! User logic plugs in through [`ChunkTask`]: one `map` entry point run
//! per chunk and one associative, commutative `reduce` that merges
//! partials. The framework fans map calls out across nodes and across
//! each node's runtime workers, combines partials pairwise up a reduction
//! tree, and runs the optional `finish` hook exactly once on the invoking
//! node. Partials cross the in-process RPC boundary type-erased and are
//! restored at the edges.

pub(crate) mod local;

mod distributed;

use std::any::Any;

use crate::error::{ChunkflowError, ChunkflowResult};
use crate::frame::ChunkData;

pub use distributed::{run_over, run_over_cancellable, run_over_columns};

/// Per-chunk map/reduce strategy over one or more aligned columns.
///
/// `map` receives one materialized chunk per in-scope column, all
/// covering the same row range. `reduce` must be associative and
/// commutative, with `identity` as its neutral element; the framework
/// guarantees nothing about chunk visitation or combine order. `finish`
/// sees the fully merged result exactly once.
pub trait ChunkTask: Send + Sync + 'static {
    type Partial: Send + 'static;

    /// Neutral element of `reduce`; also the result over an empty frame
    fn identity(&self) -> Self::Partial;

    /// Process one chunk's worth of rows
    fn map(&self, chunks: &[ChunkData]) -> anyhow::Result<Self::Partial>;

    /// Merge two partials; order must not matter
    fn reduce(&self, left: Self::Partial, right: Self::Partial) -> Self::Partial;

    /// Book-keeping over the fully merged result, on the invoking node only
    fn finish(&self, merged: Self::Partial) -> Self::Partial {
        merged
    }
}

/// Type-erased partial result moving through the reduction tree
pub(crate) type AnyPartial = Box<dyn Any + Send>;

/// Object-safe view of a [`ChunkTask`] for dispatch over node channels
pub(crate) trait ErasedTask: Send + Sync {
    fn identity_dyn(&self) -> AnyPartial;
    fn map_dyn(&self, chunks: &[ChunkData]) -> anyhow::Result<AnyPartial>;
    fn reduce_dyn(&self, left: AnyPartial, right: AnyPartial) -> ChunkflowResult<AnyPartial>;
}

impl<T: ChunkTask> ErasedTask for T {
    fn identity_dyn(&self) -> AnyPartial {
        Box::new(self.identity())
    }

    fn map_dyn(&self, chunks: &[ChunkData]) -> anyhow::Result<AnyPartial> {
        self.map(chunks).map(|p| Box::new(p) as AnyPartial)
    }

    fn reduce_dyn(&self, left: AnyPartial, right: AnyPartial) -> ChunkflowResult<AnyPartial> {
        let left = downcast_partial::<T::Partial>(left)?;
        let right = downcast_partial::<T::Partial>(right)?;
        Ok(Box::new(self.reduce(*left, *right)))
    }
}

pub(crate) fn downcast_partial<P: 'static>(any: AnyPartial) -> ChunkflowResult<Box<P>> {
    any.downcast()
        .map_err(|_| ChunkflowError::internal("chunk task partial has the wrong type"))
}
