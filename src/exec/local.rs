//! Local fork-join reduction tree
//!
//! On each node the owned chunk ordinals are split recursively down to
//! the configured grain; leaves materialize their chunks and run `map`,
//! and sibling subtasks combine pairwise as they complete. Each leaf
//! returns an owned partial, so there is no shared accumulator. The stop
//! flag is observed between leaves and splits, never inside one `map`.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::trace;

use super::{AnyPartial, ErasedTask};
use crate::cluster::NodeHandle;
use crate::error::{ChunkflowError, ChunkflowResult};
use crate::frame::Column;
use crate::job::StopToken;

pub(crate) fn run_tree(
    node: NodeHandle,
    task: Arc<dyn ErasedTask>,
    columns: Arc<Vec<Column>>,
    mut ordinals: Vec<usize>,
    stop: StopToken,
) -> BoxFuture<'static, ChunkflowResult<AnyPartial>> {
    async move {
        if stop.is_stopped() {
            return Err(ChunkflowError::Cancelled);
        }
        if ordinals.len() <= node.grain() {
            return run_leaf(&node, &task, &columns, &ordinals, &stop).await;
        }

        let right_ordinals = ordinals.split_off(ordinals.len() / 2);
        let left = tokio::spawn(run_tree(
            node.clone(),
            task.clone(),
            columns.clone(),
            ordinals,
            stop.clone(),
        ));
        let right = tokio::spawn(run_tree(
            node.clone(),
            task.clone(),
            columns.clone(),
            right_ordinals,
            stop.clone(),
        ));

        // Await both siblings even when one fails; the surviving partial
        // is discarded rather than leaving work running unobserved.
        let left = flatten_join(left.await);
        let right = flatten_join(right.await);
        match (left, right) {
            (Ok(a), Ok(b)) => task.reduce_dyn(a, b),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }
    .boxed()
}

async fn run_leaf(
    node: &NodeHandle,
    task: &Arc<dyn ErasedTask>,
    columns: &Arc<Vec<Column>>,
    ordinals: &[usize],
    stop: &StopToken,
) -> ChunkflowResult<AnyPartial> {
    let mut acc = task.identity_dyn();
    for &ordinal in ordinals {
        if stop.is_stopped() {
            return Err(ChunkflowError::Cancelled);
        }
        let mut chunks = Vec::with_capacity(columns.len());
        for column in columns.iter() {
            chunks.push(column.chunk(node, ordinal).await?);
        }
        trace!(node = node.id(), ordinal, "mapping chunk");
        let partial = task
            .map_dyn(&chunks)
            .map_err(|cause| ChunkflowError::task_failed(node.id(), cause))?;
        acc = task.reduce_dyn(acc, partial)?;
    }
    Ok(acc)
}

fn flatten_join(
    joined: Result<ChunkflowResult<AnyPartial>, tokio::task::JoinError>,
) -> ChunkflowResult<AnyPartial> {
    match joined {
        Ok(result) => result,
        Err(join_err) => Err(ChunkflowError::internal(format!(
            "chunk subtask panicked: {join_err}"
        ))),
    }
}
