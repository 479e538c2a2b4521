//! Chunk payloads: the unit of parallel work and network transfer

use serde::{Deserialize, Serialize};

/// Materialized values of one contiguous row range of one column.
/// `None` marks a missing value; statistics tasks skip missings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkData {
    values: Vec<Option<f64>>,
}

impl ChunkData {
    pub fn new(values: Vec<Option<f64>>) -> Self {
        Self { values }
    }

    /// All-present chunk from plain values
    pub fn dense(values: &[f64]) -> Self {
        Self {
            values: values.iter().copied().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at `row` within this chunk, `None` when missing
    pub fn at(&self, row: usize) -> Option<f64> {
        self.values.get(row).copied().flatten()
    }

    pub fn is_missing(&self, row: usize) -> bool {
        self.at(row).is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<f64>> + '_ {
        self.values.iter().copied()
    }
}
