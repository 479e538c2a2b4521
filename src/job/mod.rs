//! Job lifecycle: cancellable, observable units of distributed work
//!
//! A job moves `Created → Running → {Done, Cancelled, Failed}`; terminal
//! states absorb. Cancellation is cooperative and advisory: requesting a
//! stop sets an atomic flag, and the work itself polls `is_running()`
//! between logical iterations. Nothing is force-killed mid-chunk. Scope
//! cleanup and lock release run on every exit path, and the job record is
//! published to the store at each transition so other nodes can observe
//! state and progress.

pub mod scope;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cluster::NodeHandle;
use crate::error::{ChunkflowError, ChunkflowResult};
use crate::store::key::Key;

pub use scope::Scope;

/// Identity of one job, unique across the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobState {
    Created = 0,
    Running = 1,
    Done = 2,
    Cancelled = 3,
    Failed = 4,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }

    fn can_transition_to(self, to: JobState) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::Running)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Cancelled)
                | (Self::Running, Self::Failed)
        )
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Done,
            3 => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

/// Shared stop flag for cooperative cancellation
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Serializable snapshot of a job, published under its key so any node
/// (or the REST layer above) can read state and progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub description: String,
    pub state: JobState,
    pub worked: u64,
    pub total: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct JobInner {
    id: JobId,
    key: Key,
    description: String,
    state: AtomicU8,
    worked: AtomicU64,
    total: u64,
    error: OnceCell<String>,
    stop: StopToken,
    created_at: DateTime<Utc>,
    finished_at: OnceCell<DateTime<Utc>>,
}

impl JobInner {
    fn new(description: String, total: u64) -> Self {
        let id = JobId::new();
        Self {
            key: Key::new(format!("jobs/{id}")),
            id,
            description,
            state: AtomicU8::new(JobState::Created as u8),
            worked: AtomicU64::new(0),
            total,
            error: OnceCell::new(),
            stop: StopToken::new(),
            created_at: Utc::now(),
            finished_at: OnceCell::new(),
        }
    }

    fn load_state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Apply a transition if legal; terminal states absorb silently
    fn transition(&self, to: JobState) -> bool {
        let mut raw = self.state.load(Ordering::Acquire);
        loop {
            let current = JobState::from_u8(raw);
            if !current.can_transition_to(to) {
                debug!(job = %self.id, ?current, ?to, "transition refused");
                return false;
            }
            match self.state.compare_exchange(
                raw,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => raw = actual,
            }
        }
    }

    fn set_error(&self, message: String) {
        let _ = self.error.set(message);
    }

    fn mark_finished(&self) {
        let _ = self.finished_at.set(Utc::now());
    }

    fn record(&self) -> JobRecord {
        JobRecord {
            id: self.id.clone(),
            description: self.description.clone(),
            state: self.load_state(),
            worked: self.worked.load(Ordering::Relaxed),
            total: self.total,
            error: self.error.get().cloned(),
            created_at: self.created_at,
            finished_at: self.finished_at.get().copied(),
        }
    }
}

/// The running work's view of its own job
pub struct JobContext<R> {
    inner: Arc<JobInner>,
    node: NodeHandle,
    scope: Arc<Scope>,
    checkpoint: Arc<Mutex<Option<R>>>,
}

impl<R> Clone for JobContext<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            node: self.node.clone(),
            scope: self.scope.clone(),
            checkpoint: self.checkpoint.clone(),
        }
    }
}

impl<R> JobContext<R> {
    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    /// Scope tracking transient keys; exits automatically with the job
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn job_id(&self) -> &JobId {
        &self.inner.id
    }

    pub fn job_key(&self) -> &Key {
        &self.inner.key
    }

    pub fn stop_token(&self) -> &StopToken {
        &self.inner.stop
    }

    /// Cooperative check point: poll this between logical iterations
    pub fn is_running(&self) -> bool {
        !self.inner.stop.is_stopped() && self.inner.load_state() == JobState::Running
    }

    /// Advance the progress counter by `units` of the declared total.
    /// Call at well-defined checkpoints, not on every low-level step.
    pub fn worked(&self, units: u64) {
        self.inner.worked.fetch_add(units, Ordering::Relaxed);
    }

    /// Retain `partial` as the result a cancelled job hands back
    pub fn checkpoint(&self, partial: R) {
        if let Ok(mut slot) = self.checkpoint.lock() {
            *slot = Some(partial);
        }
    }
}

/// Handle to a submitted job
pub struct JobHandle<R> {
    inner: Arc<JobInner>,
    checkpoint: Arc<Mutex<Option<R>>>,
    join: tokio::sync::Mutex<Option<JoinHandle<ChunkflowResult<R>>>>,
}

impl<R: Send + 'static> JobHandle<R> {
    /// Submit `work` as a new job on `node`. The work receives a
    /// [`JobContext`] and owes the framework cooperative stop checks at
    /// its iteration boundaries; scope exit and lock release are the
    /// driver's duty on every path out.
    pub fn submit<F, Fut>(
        node: &NodeHandle,
        description: impl Into<String>,
        total_work: u64,
        work: F,
    ) -> JobHandle<R>
    where
        F: FnOnce(JobContext<R>) -> Fut + Send + 'static,
        Fut: Future<Output = ChunkflowResult<R>> + Send + 'static,
    {
        let inner = Arc::new(JobInner::new(description.into(), total_work));
        let scope = Arc::new(Scope::enter_for_job(node.clone(), inner.id.clone()));
        let checkpoint = Arc::new(Mutex::new(None));
        let ctx = JobContext {
            inner: inner.clone(),
            node: node.clone(),
            scope,
            checkpoint: checkpoint.clone(),
        };
        debug!(job = %inner.id, description = %inner.description, "job submitted");

        let join = tokio::spawn(drive(ctx, work));
        JobHandle {
            inner,
            checkpoint,
            join: tokio::sync::Mutex::new(Some(join)),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.inner.id
    }

    pub fn key(&self) -> &Key {
        &self.inner.key
    }

    pub fn state(&self) -> JobState {
        self.inner.load_state()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stop.is_stopped() && self.state() == JobState::Running
    }

    /// Advisory cancellation; observed at the work's next check point
    pub fn request_stop(&self) {
        debug!(job = %self.inner.id, "stop requested");
        self.inner.stop.request_stop();
    }

    /// Fractional completion in `[0, 1]`
    pub fn progress(&self) -> f64 {
        let worked = self.inner.worked.load(Ordering::Relaxed);
        if self.inner.total == 0 {
            return if self.state().is_terminal() { 1.0 } else { 0.0 };
        }
        (worked as f64 / self.inner.total as f64).min(1.0)
    }

    /// Terminal error of a failed job, retained for inspection
    pub fn error(&self) -> Option<String> {
        self.inner.error.get().cloned()
    }

    /// Wait for the job to reach a terminal state. `Done` yields the
    /// work's result, `Cancelled` yields the last checkpointed partial
    /// (if any), `Failed` re-raises the retained error.
    pub async fn await_result(&self) -> ChunkflowResult<Option<R>> {
        let Some(join) = self.join.lock().await.take() else {
            return self.terminal_outcome();
        };
        match join.await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(err)) if err.is_cancelled() => {
                Ok(self.checkpoint.lock().ok().and_then(|mut slot| slot.take()))
            }
            Ok(Err(err)) => Err(err),
            Err(join_err) => {
                self.inner.set_error(join_err.to_string());
                self.inner.transition(JobState::Failed);
                Err(ChunkflowError::internal(format!(
                    "job driver panicked: {join_err}"
                )))
            }
        }
    }

    /// Outcome reported to observers after the driver was already awaited.
    /// The typed result moved out with the first call, but the terminal
    /// state and retained error still describe how the job ended.
    fn terminal_outcome(&self) -> ChunkflowResult<Option<R>> {
        match self.state() {
            JobState::Failed => Err(self
                .error()
                .map(ChunkflowError::Internal)
                .unwrap_or_else(|| ChunkflowError::internal("job failed"))),
            JobState::Cancelled => {
                Ok(self.checkpoint.lock().ok().and_then(|mut slot| slot.take()))
            }
            JobState::Done => Ok(None),
            // Another caller holds the driver and the job is still running
            _ => Err(ChunkflowError::internal("job result already consumed")),
        }
    }
}

async fn drive<R, F, Fut>(ctx: JobContext<R>, work: F) -> ChunkflowResult<R>
where
    R: Send + 'static,
    F: FnOnce(JobContext<R>) -> Fut + Send + 'static,
    Fut: Future<Output = ChunkflowResult<R>> + Send + 'static,
{
    let inner = ctx.inner.clone();
    let node = ctx.node.clone();
    let scope = ctx.scope.clone();

    inner.transition(JobState::Running);
    publish_record(&node, &inner).await;

    let outcome = work(ctx).await;

    // Cleanup runs on every path out of the work, including failure
    scope.exit_all().await;
    node.release_job_locks_everywhere(&inner.id);

    let result = match outcome {
        Ok(value) => {
            let to = if inner.stop.is_stopped() {
                JobState::Cancelled
            } else {
                JobState::Done
            };
            inner.transition(to);
            Ok(value)
        }
        Err(err) if err.is_cancelled() => {
            inner.transition(JobState::Cancelled);
            debug!(job = %inner.id, "job cancelled at a check point");
            Err(ChunkflowError::Cancelled)
        }
        Err(err) => {
            inner.set_error(err.to_string());
            inner.transition(JobState::Failed);
            warn!(job = %inner.id, %err, "job failed");
            Err(err)
        }
    };

    inner.mark_finished();
    publish_record(&node, &inner).await;
    result
}

/// Best-effort publication of the job record; a store hiccup must not
/// change the job's outcome
async fn publish_record(node: &NodeHandle, inner: &JobInner) {
    if let Err(err) = node.put(&inner.key, &inner.record()).await {
        warn!(job = %inner.id, %err, "could not publish job record");
    }
}
