//! Frames: named collections of aligned columns

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::NodeHandle;
use crate::error::{ChunkflowError, ChunkflowResult};
use crate::frame::chunk::ChunkData;
use crate::frame::column::{Column, RowLayout};
use crate::job::JobId;
use crate::store::key::Key;

/// An ordered, named mapping from column name to column. All columns
/// share the same row count and chunk boundaries; a frame with zero rows
/// or zero columns is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    key: Key,
    names: Vec<String>,
    columns: Vec<Column>,
}

impl Frame {
    /// Build a frame from per-column values, write every chunk and the
    /// frame header into the store, and return the handle. Arguments are
    /// validated before anything is published.
    pub async fn create(
        node: &NodeHandle,
        key: Key,
        chunk_rows: u64,
        columns: Vec<(String, Vec<Option<f64>>)>,
    ) -> ChunkflowResult<Frame> {
        validate_columns(&columns)?;
        let rows = columns.first().map(|(_, v)| v.len() as u64).unwrap_or(0);
        let layout = RowLayout::with_chunk_rows(rows, chunk_rows)?;

        let mut built = Vec::with_capacity(columns.len());
        let mut names = Vec::with_capacity(columns.len());
        for (col_idx, (name, values)) in columns.into_iter().enumerate() {
            let mut chunk_keys = Vec::with_capacity(layout.n_chunks());
            for ordinal in 0..layout.n_chunks() {
                let range = self::chunk_slice(&layout, ordinal);
                let chunk_key = Key::chunk_key(&key, col_idx, ordinal);
                let payload = ChunkData::new(values[range.0..range.1].to_vec());
                node.put(&chunk_key, &payload).await?;
                chunk_keys.push(chunk_key);
            }
            built.push(Column::new(
                Key::new(format!("{}/{}", key, name)),
                layout.clone(),
                chunk_keys,
            ));
            names.push(name);
        }

        let frame = Frame {
            key,
            names,
            columns: built,
        };
        node.put(frame.key(), &frame).await?;
        debug!(frame = %frame.key, rows, n_chunks = layout.n_chunks(), "frame published");
        Ok(frame)
    }

    /// Convenience for all-present data
    pub async fn create_dense(
        node: &NodeHandle,
        key: Key,
        chunk_rows: u64,
        columns: Vec<(String, Vec<f64>)>,
    ) -> ChunkflowResult<Frame> {
        let lifted = columns
            .into_iter()
            .map(|(name, values)| (name, values.into_iter().map(Some).collect()))
            .collect();
        Self::create(node, key, chunk_rows, lifted).await
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn rows(&self) -> u64 {
        self.columns.first().map(|c| c.rows()).unwrap_or(0)
    }

    pub fn n_chunks(&self) -> usize {
        self.columns.first().map(|c| c.n_chunks()).unwrap_or(0)
    }

    /// Column lookup by name
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| &self.columns[idx])
    }

    /// Every key this frame occupies in the store: the header plus all
    /// chunk payloads. Track these in a scope to make the frame transient.
    pub fn tracked_keys(&self) -> Vec<Key> {
        let mut keys = vec![self.key.clone()];
        for column in &self.columns {
            keys.extend(column.chunk_keys().iter().cloned());
        }
        keys
    }

    /// Structural removal of the frame and all its chunks. The header is
    /// removed first, so a write lock held by another job fails the whole
    /// delete before any chunk disappears.
    pub async fn delete(&self, node: &NodeHandle, job: Option<&JobId>) -> ChunkflowResult<()> {
        match job {
            Some(job) => node.remove_as(&self.key, job).await?,
            None => node.remove(&self.key).await?,
        };
        for column in &self.columns {
            for chunk_key in column.chunk_keys() {
                match job {
                    Some(job) => node.remove_as(chunk_key, job).await?,
                    None => node.remove(chunk_key).await?,
                };
            }
        }
        debug!(frame = %self.key, "frame deleted");
        Ok(())
    }
}

fn chunk_slice(layout: &RowLayout, ordinal: usize) -> (usize, usize) {
    // Caller iterates 0..n_chunks, so the range always exists
    let range = layout.chunk_rows(ordinal).unwrap_or(0..0);
    (range.start as usize, range.end as usize)
}

fn validate_columns(columns: &[(String, Vec<Option<f64>>)]) -> ChunkflowResult<()> {
    let rows = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
    for (idx, (name, values)) in columns.iter().enumerate() {
        if name.is_empty() {
            return Err(ChunkflowError::validation(
                "columns",
                format!("column {idx} has an empty name"),
            ));
        }
        if columns[..idx].iter().any(|(other, _)| other == name) {
            return Err(ChunkflowError::validation(
                "columns",
                format!("duplicate column name '{name}'"),
            ));
        }
        if values.len() != rows {
            return Err(ChunkflowError::validation(
                "columns",
                format!(
                    "column '{}' has {} rows, expected {} to align with the first column",
                    name,
                    values.len(),
                    rows
                ),
            ));
        }
    }
    Ok(())
}
