//! End-to-end scenarios across the whole substrate: clusters, frames,
//! distributed tasks, jobs, scopes, and locks working together.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use chunkflow::builder::{ColumnMaxBuilder, ColumnMaxTask, MaxModel};
use chunkflow::job::JobContext;
use chunkflow::{
    run_over, run_over_cancellable, ChunkData, ChunkTask, ChunkflowError, Cluster, Frame,
    JobHandle, JobId, JobState, Key, Scope,
};

/// Opt-in log output for debugging a failing scenario: RUST_LOG=chunkflow=trace
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn random_columns(n_cols: usize, rows: usize) -> Vec<(String, Vec<Option<f64>>)> {
    let mut rng = rand::rng();
    (0..n_cols)
        .map(|c| {
            let values = (0..rows)
                .map(|_| {
                    if rng.random_bool(0.1) {
                        None
                    } else {
                        Some(rng.random_range(-1000.0..1000.0))
                    }
                })
                .collect();
            (format!("col{c}"), values)
        })
        .collect()
}

fn sequential_max(columns: &[(String, Vec<Option<f64>>)]) -> Vec<Option<f64>> {
    columns
        .iter()
        .map(|(_, values)| {
            values
                .iter()
                .flatten()
                .copied()
                .fold(None, |acc: Option<f64>, v| {
                    Some(acc.map_or(v, |a| a.max(v)))
                })
        })
        .collect()
}

#[tokio::test]
async fn distributed_max_matches_sequential_under_any_layout() {
    init_tracing();
    let columns = random_columns(3, 101);
    let expected = sequential_max(&columns);

    // Forced single-partition and forced many-partition layouts, on one
    // node and on several
    for (n_nodes, chunk_rows) in [(1usize, 101u64), (1, 7), (2, 50), (3, 7), (4, 1)] {
        let cluster = Cluster::launch(n_nodes).unwrap();
        let node = cluster.node(n_nodes - 1);
        let frame = Frame::create(&node, Key::random("frames"), chunk_rows, columns.clone())
            .await
            .unwrap();

        let task = Arc::new(ColumnMaxTask::new(frame.n_cols()));
        let maxs = run_over(&node, task, &frame).await.unwrap();
        assert_eq!(
            maxs, expected,
            "layout n_nodes={n_nodes} chunk_rows={chunk_rows}"
        );
    }
}

#[tokio::test]
async fn atomic_update_commits_every_concurrent_transform() {
    let cluster = Cluster::launch(3).unwrap();
    let key = Key::random("tally");
    const WRITERS: usize = 24;

    let mut joins = Vec::new();
    for w in 0..WRITERS {
        let node = cluster.node(w % 3);
        let key = key.clone();
        joins.push(tokio::spawn(async move {
            node.atomic_update(&key, |cur: Option<u64>| cur.unwrap_or(0) + 1)
                .await
                .unwrap()
        }));
    }
    for join in joins {
        join.await.unwrap();
    }

    let total: u64 = cluster.node(1).get_required(&key).await.unwrap();
    assert_eq!(total, WRITERS as u64, "no update may be lost");
}

#[tokio::test]
async fn write_lock_excludes_other_jobs_until_released() {
    let cluster = Cluster::launch(2).unwrap();
    let node = cluster.node(0);
    let key = Key::random("locked");
    let (job1, job2) = (JobId::new(), JobId::new());

    node.put(&key, &"payload").await.unwrap();
    node.lock_for_write(&key, &job1).await.unwrap();

    let err = node.lock_for_write(&key, &job2).await.unwrap_err();
    assert!(matches!(err, ChunkflowError::LockViolation { .. }));
    let err = cluster.node(1).remove_as(&key, &job2).await.unwrap_err();
    assert!(matches!(err, ChunkflowError::ObjectInUse { .. }));

    node.unlock(&key, &job1).await.unwrap();
    cluster.node(1).lock_for_write(&key, &job2).await.unwrap();
}

/// Per-column max that blows up on the chunk containing `poison`
struct FaultyMax {
    inner: ColumnMaxTask,
    poison: f64,
}

impl ChunkTask for FaultyMax {
    type Partial = Vec<Option<f64>>;

    fn identity(&self) -> Self::Partial {
        self.inner.identity()
    }

    fn map(&self, chunks: &[ChunkData]) -> anyhow::Result<Self::Partial> {
        for chunk in chunks {
            if chunk.iter().flatten().any(|v| v == self.poison) {
                anyhow::bail!("simulated failure at value {}", self.poison);
            }
        }
        self.inner.map(chunks)
    }

    fn reduce(&self, left: Self::Partial, right: Self::Partial) -> Self::Partial {
        self.inner.reduce(left, right)
    }
}

#[tokio::test]
async fn failing_partition_fails_the_job_and_publishes_nothing() {
    // Three chunks across two nodes, error injected on one chunk
    let cluster = Cluster::launch(2).unwrap();
    let node = cluster.node(0);
    let frame = Frame::create_dense(
        &node,
        Key::random("frames"),
        2,
        vec![("x".into(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])],
    )
    .await
    .unwrap();
    assert_eq!(frame.n_chunks(), 3);

    let dest = Key::random("models");
    let dest_for_job = dest.clone();
    let frame_for_job = frame.clone();
    let handle = JobHandle::submit(
        &node,
        "faulty-max",
        1,
        move |ctx: JobContext<MaxModel>| async move {
            let task = Arc::new(FaultyMax {
                inner: ColumnMaxTask::new(frame_for_job.n_cols()),
                poison: 4.0,
            });
            ctx.scope().track(dest_for_job.clone());
            ctx.node()
                .lock_for_write(&dest_for_job, ctx.job_id())
                .await?;

            let maxs =
                run_over_cancellable(ctx.node(), task, &frame_for_job, ctx.stop_token()).await?;
            let model = MaxModel {
                key: dest_for_job.clone(),
                maxs,
                iters: 1,
            };
            ctx.node().put(&dest_for_job, &model).await?;
            ctx.scope().exempt(&dest_for_job);
            Ok(model)
        },
    );

    let err = handle.await_result().await.unwrap_err();
    assert!(err.is_task_failure(), "got {err}");
    assert!(err.to_string().contains("simulated failure"));
    assert!(err.to_string().contains("node"), "origin node is named: {err}");

    assert_eq!(handle.state(), JobState::Failed);
    assert!(handle.error().is_some());
    // No partial model escaped the scope
    let published: Option<MaxModel> = node.get(&dest).await.unwrap();
    assert!(published.is_none());
    // And the job's write lock is gone, so the key is free again
    node.put(&dest, &"reusable").await.unwrap();
    assert!(node.remove(&dest).await.unwrap());
}

#[tokio::test]
async fn stop_request_cancels_iteration_and_cleans_temporaries() {
    let cluster = Cluster::launch(2).unwrap();
    let node = cluster.node(0);
    let temp = Key::random("scratch");

    let temp_for_job = temp.clone();
    let node_for_job = node.clone();
    let handle = JobHandle::submit(
        &node,
        "long-iterative",
        1000,
        move |ctx: JobContext<u64>| async move {
            node_for_job.put(&temp_for_job, &"working copy").await?;
            ctx.scope().track(temp_for_job.clone());

            let mut iters = 0u64;
            while iters < 1000 && ctx.is_running() {
                iters += 1;
                ctx.worked(1);
                ctx.checkpoint(iters);
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
            Ok(iters)
        },
    );

    // Let at least one checkpoint land before asking for the stop
    while handle.progress() == 0.0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    handle.request_stop();

    let result = handle.await_result().await.unwrap();
    assert_eq!(handle.state(), JobState::Cancelled);
    assert!(result.is_some_and(|iters| (1..1000).contains(&iters)));
    assert!(handle.progress() > 0.0);

    // Scope-tracked temporaries are gone
    let leftover: Option<String> = node.get(&temp).await.unwrap();
    assert!(leftover.is_none());
}

#[tokio::test]
async fn cancelled_training_keeps_partial_model_but_drops_scratch() {
    let cluster = Cluster::launch(2).unwrap();
    let node = cluster.node(0);
    let frame = Frame::create_dense(
        &node,
        Key::random("frames"),
        8,
        vec![("x".into(), (0..64).map(|v| v as f64).collect())],
    )
    .await
    .unwrap();

    let dest = Key::random("models");
    let handle = ColumnMaxBuilder::new(500_000)
        .train(&node, &frame, dest.clone())
        .unwrap();

    while handle.progress() == 0.0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    handle.request_stop();

    let model = handle.await_result().await.unwrap();
    assert_eq!(handle.state(), JobState::Cancelled);
    let model = model.expect("at least one checkpointed iteration");
    assert!(model.iters >= 1);
    assert_eq!(model.maxs, vec![Some(63.0)]);
}

#[tokio::test]
async fn standalone_scope_cleanup_respects_exemptions() {
    let cluster = Cluster::launch(3).unwrap();
    let node = cluster.node(2);
    let scope = Scope::enter(node.clone());

    let mut temps = Vec::new();
    for i in 0..5 {
        let key = Key::random(&format!("tmp{i}"));
        node.put(&key, &i).await.unwrap();
        scope.track(key.clone());
        temps.push(key);
    }
    let survivor = temps[3].clone();
    scope.exempt(&survivor);

    assert_eq!(scope.exit().await, 4);
    for (i, key) in temps.iter().enumerate() {
        let stored: Option<i32> = node.get(key).await.unwrap();
        if i == 3 {
            assert_eq!(stored, Some(3));
        } else {
            assert_eq!(stored, None, "{key} should be cleaned");
        }
    }
}

#[tokio::test]
async fn validation_errors_never_start_a_job() {
    let cluster = Cluster::launch(1).unwrap();
    let node = cluster.node(0);
    let frame = Frame::create_dense(&node, Key::random("f"), 2, vec![("a".into(), vec![1.0])])
        .await
        .unwrap();

    let err = ColumnMaxBuilder::new(0)
        .train(&node, &frame, Key::random("m"))
        .err()
        .expect("synchronous validation error");
    assert!(matches!(err, ChunkflowError::Validation { .. }));
}
