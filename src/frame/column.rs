//! Columns and the shared row layout
//!
//! A column is one attribute's full distributed sequence of values. Its
//! payload lives in the store as one keyed chunk per contiguous row range;
//! all columns of a frame share one [`RowLayout`], so row `i` of every
//! column sits behind the same home node.

use serde::{Deserialize, Serialize};

use crate::cluster::NodeHandle;
use crate::error::{ChunkflowError, ChunkflowResult};
use crate::frame::chunk::ChunkData;
use crate::store::key::Key;

/// Chunk boundaries shared by every column of a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLayout {
    /// First row of each chunk, ascending; empty for a zero-row layout
    starts: Vec<u64>,
    rows: u64,
}

impl RowLayout {
    /// Split `rows` into chunks of `chunk_rows` (the last may be shorter)
    pub fn with_chunk_rows(rows: u64, chunk_rows: u64) -> ChunkflowResult<Self> {
        if chunk_rows == 0 {
            return Err(ChunkflowError::validation(
                "chunk_rows",
                "must be at least 1",
            ));
        }
        let starts = (0..rows).step_by(chunk_rows as usize).collect();
        Ok(Self { starts, rows })
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn n_chunks(&self) -> usize {
        self.starts.len()
    }

    /// Ordinal of the chunk holding `row`
    pub fn chunk_for_row(&self, row: u64) -> Option<usize> {
        if row >= self.rows {
            return None;
        }
        Some(self.starts.partition_point(|&start| start <= row) - 1)
    }

    /// Row range `[start, end)` covered by chunk `ordinal`
    pub fn chunk_rows(&self, ordinal: usize) -> Option<std::ops::Range<u64>> {
        let start = *self.starts.get(ordinal)?;
        let end = self.starts.get(ordinal + 1).copied().unwrap_or(self.rows);
        Some(start..end)
    }
}

/// One attribute of a frame, physically split into keyed chunks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    key: Key,
    layout: RowLayout,
    chunk_keys: Vec<Key>,
}

impl Column {
    pub(crate) fn new(key: Key, layout: RowLayout, chunk_keys: Vec<Key>) -> Self {
        Self {
            key,
            layout,
            chunk_keys,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn rows(&self) -> u64 {
        self.layout.rows()
    }

    pub fn n_chunks(&self) -> usize {
        self.chunk_keys.len()
    }

    pub fn chunk_for_row(&self, row: u64) -> Option<usize> {
        self.layout.chunk_for_row(row)
    }

    pub fn chunk_key(&self, ordinal: usize) -> ChunkflowResult<&Key> {
        self.chunk_keys.get(ordinal).ok_or_else(|| {
            ChunkflowError::validation(
                "ordinal",
                format!(
                    "column '{}' has {} chunks, asked for chunk {}",
                    self.key,
                    self.chunk_keys.len(),
                    ordinal
                ),
            )
        })
    }

    /// Materialize chunk `ordinal`. The store decides whether the payload
    /// is local or needs a remote fetch; algorithm code never does.
    pub async fn chunk(&self, node: &NodeHandle, ordinal: usize) -> ChunkflowResult<ChunkData> {
        let key = self.chunk_key(ordinal)?;
        node.get_required(key).await
    }

    pub(crate) fn chunk_keys(&self) -> &[Key] {
        &self.chunk_keys
    }
}
