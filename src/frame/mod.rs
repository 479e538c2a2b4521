//! Partitioned columnar data model
//!
//! Frames are named collections of columns; columns are split into keyed
//! chunks homed across the cluster. Chunk boundaries are identical across
//! all columns of a frame, so row `i` always lives on one node regardless
//! of which column is read.

pub mod chunk;
pub mod column;

#[allow(clippy::module_inception)]
mod frame;

pub use chunk::ChunkData;
pub use column::{Column, RowLayout};
pub use frame::Frame;
