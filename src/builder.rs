//! Reference model builder: iterative per-column maximum
//!
//! The smallest real exercise of the whole substrate. Each iteration runs
//! one chunk task over the training frame, atomically republishes the
//! model, advances progress by one unit, and polls the cooperative stop
//! flag. The destination key is write-locked for the duration and only
//! escapes the job's scope once training finishes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::NodeHandle;
use crate::error::{ChunkflowError, ChunkflowResult};
use crate::exec::{self, ChunkTask};
use crate::frame::{ChunkData, Frame};
use crate::job::{JobContext, JobHandle};
use crate::store::key::Key;

const MAX_ITERS_LIMIT: u64 = 9_999_999;

/// Per-column maximum over a frame, skipping missing values
pub struct ColumnMaxTask {
    n_cols: usize,
}

impl ColumnMaxTask {
    pub fn new(n_cols: usize) -> Self {
        Self { n_cols }
    }
}

impl ChunkTask for ColumnMaxTask {
    type Partial = Vec<Option<f64>>;

    fn identity(&self) -> Self::Partial {
        vec![None; self.n_cols]
    }

    fn map(&self, chunks: &[ChunkData]) -> anyhow::Result<Self::Partial> {
        let mut maxs = vec![None; self.n_cols];
        for (col, chunk) in chunks.iter().enumerate() {
            for value in chunk.iter().flatten() {
                maxs[col] = max_opt(maxs[col], Some(value));
            }
        }
        Ok(maxs)
    }

    fn reduce(&self, left: Self::Partial, right: Self::Partial) -> Self::Partial {
        left.into_iter()
            .zip(right)
            .map(|(a, b)| max_opt(a, b))
            .collect()
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Published result of a [`ColumnMaxBuilder`] run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaxModel {
    pub key: Key,
    pub maxs: Vec<Option<f64>>,
    pub iters: u64,
}

/// Trains a [`MaxModel`] by running the max task `max_iters` times
#[derive(Debug, Clone)]
pub struct ColumnMaxBuilder {
    pub max_iters: u64,
}

impl ColumnMaxBuilder {
    pub fn new(max_iters: u64) -> Self {
        Self { max_iters }
    }

    /// Generic range check, before any job starts
    pub fn validate(&self) -> ChunkflowResult<()> {
        if self.max_iters < 1 || self.max_iters > MAX_ITERS_LIMIT {
            return Err(ChunkflowError::validation(
                "max_iters",
                format!("must be between 1 and {MAX_ITERS_LIMIT}"),
            ));
        }
        Ok(())
    }

    /// Start training against `frame`, publishing the model under `dest`.
    /// Validation errors surface synchronously and never start a job.
    pub fn train(
        &self,
        node: &NodeHandle,
        frame: &Frame,
        dest: Key,
    ) -> ChunkflowResult<JobHandle<MaxModel>> {
        self.validate()?;
        let max_iters = self.max_iters;
        let frame = frame.clone();
        let description = format!("column-max:{dest}");

        Ok(JobHandle::submit(
            node,
            description,
            max_iters,
            move |ctx: JobContext<MaxModel>| async move {
                let task = Arc::new(ColumnMaxTask::new(frame.n_cols()));
                // The model is transient until training completes
                ctx.scope().track(dest.clone());
                ctx.node().lock_for_write(&dest, ctx.job_id()).await?;

                let mut model = MaxModel {
                    key: dest.clone(),
                    maxs: task.identity(),
                    iters: 0,
                };
                while model.iters < max_iters && ctx.is_running() {
                    model.maxs = exec::run_over_cancellable(
                        ctx.node(),
                        task.clone(),
                        &frame,
                        ctx.stop_token(),
                    )
                    .await?;
                    model.iters += 1;

                    // Atomically publish this iteration's model to the world
                    let published = model.clone();
                    ctx.node()
                        .atomic_update(&dest, move |_: Option<MaxModel>| published.clone())
                        .await?;
                    ctx.worked(1);
                    ctx.checkpoint(model.clone());
                    debug!(model = %dest, iters = model.iters, "iteration published");
                }

                // A finished (or cooperatively stopped) model escapes the scope
                ctx.scope().exempt(&dest);
                ctx.node().unlock(&dest, ctx.job_id()).await?;
                Ok(model)
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::job::JobState;

    #[test]
    fn iteration_bound_is_range_checked() {
        assert!(ColumnMaxBuilder::new(0).validate().is_err());
        assert!(ColumnMaxBuilder::new(1).validate().is_ok());
        assert!(ColumnMaxBuilder::new(MAX_ITERS_LIMIT).validate().is_ok());
        assert!(ColumnMaxBuilder::new(MAX_ITERS_LIMIT + 1).validate().is_err());
    }

    #[test]
    fn reduce_is_missing_aware() {
        let task = ColumnMaxTask::new(3);
        let merged = task.reduce(
            vec![Some(1.0), None, Some(-2.0)],
            vec![Some(0.5), None, Some(4.0)],
        );
        assert_eq!(merged, vec![Some(1.0), None, Some(4.0)]);
    }

    #[tokio::test]
    async fn trains_and_publishes_the_model() {
        let cluster = Cluster::launch(2).unwrap();
        let node = cluster.node(0);
        let frame = Frame::create(
            &node,
            Key::random("frames"),
            2,
            vec![
                ("x".into(), vec![Some(1.0), Some(9.0), Some(3.0), None]),
                ("y".into(), vec![None, None, None, None]),
            ],
        )
        .await
        .unwrap();

        let dest = Key::random("models");
        let handle = ColumnMaxBuilder::new(3)
            .train(&node, &frame, dest.clone())
            .unwrap();
        let model = handle.await_result().await.unwrap().expect("model");

        assert_eq!(handle.state(), JobState::Done);
        assert_eq!(model.iters, 3);
        assert_eq!(model.maxs, vec![Some(9.0), None]);

        // Published under its key, observable from another node
        let stored: MaxModel = cluster.node(1).get_required(&dest).await.unwrap();
        assert_eq!(stored, model);
        // The job released its write lock, so the model can be removed
        assert!(cluster.node(1).remove(&dest).await.unwrap());
    }
}
