//! Scopes: stack-discipline cleanup of transient keys
//!
//! A scope tracks every key a unit of work creates and removes them from
//! the store when the unit ends, unless a key was explicitly exempted
//! (a finished model escapes its scope; temporary working copies do not).
//! Frames pop in LIFO order and keys within a frame are removed in
//! reverse insertion order. Cleanup is defensive: a failed removal is
//! logged and never masks the result being returned.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::cluster::NodeHandle;
use crate::job::JobId;
use crate::store::key::Key;

pub struct Scope {
    node: NodeHandle,
    /// Removals act as this job, so keys the job itself locked still clean up
    job: Option<JobId>,
    frames: Mutex<Vec<Vec<Key>>>,
    exempt: Mutex<HashSet<Key>>,
}

impl Scope {
    /// Open a scope with one tracking frame
    pub fn enter(node: NodeHandle) -> Self {
        Self {
            node,
            job: None,
            frames: Mutex::new(vec![Vec::new()]),
            exempt: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn enter_for_job(node: NodeHandle, job: JobId) -> Self {
        Self {
            job: Some(job),
            ..Self::enter(node)
        }
    }

    /// Push a nested tracking frame
    pub fn nest(&self) {
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(Vec::new());
        }
    }

    /// Register a key for removal at scope exit
    pub fn track(&self, key: Key) {
        if let Ok(mut frames) = self.frames.lock() {
            match frames.last_mut() {
                Some(frame) => frame.push(key),
                None => warn!(key = %key, "tracking after scope exit, key will leak"),
            }
        }
    }

    /// Mark a key to survive scope exit
    pub fn exempt(&self, key: &Key) {
        if let Ok(mut exempt) = self.exempt.lock() {
            exempt.insert(key.clone());
        }
    }

    /// Number of keys currently tracked across all frames
    pub fn tracked(&self) -> usize {
        self.frames
            .lock()
            .map(|frames| frames.iter().map(|f| f.len()).sum())
            .unwrap_or(0)
    }

    /// Pop the innermost frame and remove its non-exempt keys, newest
    /// first. Returns how many keys were removed.
    pub async fn exit(&self) -> usize {
        let frame = match self.frames.lock() {
            Ok(mut frames) => frames.pop(),
            Err(_) => None,
        };
        let Some(frame) = frame else {
            return 0;
        };
        self.remove_frame(frame).await
    }

    /// Pop and clean every remaining frame, innermost first
    pub(crate) async fn exit_all(&self) -> usize {
        let mut removed = 0;
        loop {
            let frame = match self.frames.lock() {
                Ok(mut frames) => frames.pop(),
                Err(_) => None,
            };
            let Some(frame) = frame else {
                return removed;
            };
            removed += self.remove_frame(frame).await;
        }
    }

    async fn remove_frame(&self, frame: Vec<Key>) -> usize {
        let mut removed = 0;
        for key in frame.into_iter().rev() {
            let exempted = self
                .exempt
                .lock()
                .map(|exempt| exempt.contains(&key))
                .unwrap_or(false);
            if exempted {
                debug!(key = %key, "key escapes scope");
                continue;
            }
            let outcome = match &self.job {
                Some(job) => self.node.remove_as(&key, job).await,
                None => self.node.remove(&key).await,
            };
            match outcome {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(key = %key, %err, "scope cleanup failed for key"),
            }
        }
        debug!(removed, "scope frame cleaned");
        removed
    }
}
