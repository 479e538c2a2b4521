//! Cluster fan-out and reduction
//!
//! The invoking node groups in-scope chunk ordinals by home node, ships
//! the task to every owning node over RPC, and combines per-node partials
//! as they arrive. The first map failure aborts the distributed task:
//! partials from nodes that finish afterwards are discarded, and the
//! caller sees exactly one error carrying the origin node and cause.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{downcast_partial, AnyPartial, ChunkTask, ErasedTask};
use crate::cluster::rpc::{Rpc, TaskRequest};
use crate::cluster::{NodeHandle, NodeId};
use crate::error::{ChunkflowError, ChunkflowResult};
use crate::frame::{Column, Frame};
use crate::job::StopToken;

/// Run `task` over every chunk of `frame` and return the fully combined
/// result. Blocks (asynchronously) until the whole reduction tree is done.
pub async fn run_over<T: ChunkTask>(
    node: &NodeHandle,
    task: Arc<T>,
    frame: &Frame,
) -> ChunkflowResult<T::Partial> {
    run_over_cancellable(node, task, frame, &StopToken::new()).await
}

/// [`run_over`] with an external stop signal, observed between reduction
/// steps but never inside a single chunk's `map`
pub async fn run_over_cancellable<T: ChunkTask>(
    node: &NodeHandle,
    task: Arc<T>,
    frame: &Frame,
    stop: &StopToken,
) -> ChunkflowResult<T::Partial> {
    run_over_columns(node, task, frame.columns(), stop).await
}

/// Run `task` over any set of aligned columns, possibly drawn from more
/// than one frame. All columns must share one row layout.
pub async fn run_over_columns<T: ChunkTask>(
    node: &NodeHandle,
    task: Arc<T>,
    columns: &[Column],
    stop: &StopToken,
) -> ChunkflowResult<T::Partial> {
    validate_alignment(columns)?;
    let n_chunks = columns.first().map(|c| c.n_chunks()).unwrap_or(0);
    if n_chunks == 0 {
        // Empty dataset: no-op with the neutral reduction result
        return Ok(task.finish(task.identity()));
    }

    let erased: Arc<dyn ErasedTask> = task.clone();
    let groups = group_by_home(node, columns, n_chunks)?;
    debug!(
        n_chunks,
        n_nodes = groups.len(),
        "dispatching chunk task"
    );

    let mut pending = FuturesUnordered::new();
    for (home, ordinals) in groups {
        if stop.is_stopped() {
            return Err(ChunkflowError::Cancelled);
        }
        let (tx, rx) = oneshot::channel();
        node.send(
            home,
            Rpc::RunTask(TaskRequest {
                task: erased.clone(),
                columns: columns.to_vec(),
                ordinals,
                stop: stop.clone(),
                reply: tx,
            }),
        )?;
        pending.push(async move { (home, rx.await) });
    }

    // Cluster reduction; combine order across nodes is unspecified
    let mut acc: Option<AnyPartial> = None;
    let mut first_err: Option<ChunkflowError> = None;
    while let Some((home, outcome)) = pending.next().await {
        match outcome {
            Err(_) => {
                first_err.get_or_insert(ChunkflowError::ClusterDown { node: home });
            }
            Ok(Err(err)) => {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    warn!(node = home, %err, "suppressing secondary task failure");
                }
            }
            Ok(Ok(partial)) => {
                if first_err.is_some() {
                    // A sibling already failed; this result is discarded
                    continue;
                }
                acc = Some(match acc.take() {
                    None => partial,
                    Some(prev) => erased.reduce_dyn(prev, partial)?,
                });
            }
        }
    }

    if let Some(err) = first_err {
        return Err(err);
    }
    if stop.is_stopped() {
        return Err(ChunkflowError::Cancelled);
    }
    let merged = match acc {
        Some(partial) => partial,
        None => erased.identity_dyn(),
    };
    let typed = downcast_partial::<T::Partial>(merged)?;
    Ok(task.finish(*typed))
}

fn validate_alignment(columns: &[Column]) -> ChunkflowResult<()> {
    let Some(first) = columns.first() else {
        return Ok(());
    };
    for column in &columns[1..] {
        if column.layout() != first.layout() {
            return Err(ChunkflowError::validation(
                "columns",
                format!(
                    "column '{}' is not aligned with column '{}'",
                    column.key(),
                    first.key()
                ),
            ));
        }
    }
    Ok(())
}

fn group_by_home(
    node: &NodeHandle,
    columns: &[Column],
    n_chunks: usize,
) -> ChunkflowResult<BTreeMap<NodeId, Vec<usize>>> {
    let mut groups: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
    for ordinal in 0..n_chunks {
        // Aligned chunks share a homing seed, so column 0 speaks for all
        let home = columns[0].chunk_key(ordinal)?.home_node(node.n_nodes());
        groups.entry(home).or_default().push(ordinal);
    }
    Ok(groups)
}
