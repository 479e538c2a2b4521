//! Write-lock table kept by each key's home node
//!
//! A lock is a relation from a key to the job currently allowed to mutate
//! the object's structure. At most one holder per key; reads never take
//! locks. The table is only touched from the home node's actor loop.

use std::collections::HashMap;

use crate::job::JobId;
use crate::store::key::Key;

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    holders: HashMap<Key, JobId>,
}

impl LockTable {
    /// Current holder of the write lock on `key`, if any
    pub fn holder(&self, key: &Key) -> Option<&JobId> {
        self.holders.get(key)
    }

    /// Acquire the write lock for `job`. Re-entrant for the same job;
    /// `Err` carries the conflicting holder.
    pub fn lock(&mut self, key: Key, job: JobId) -> Result<(), JobId> {
        match self.holders.get(&key) {
            Some(holder) if *holder != job => Err(holder.clone()),
            Some(_) => Ok(()),
            None => {
                self.holders.insert(key, job);
                Ok(())
            }
        }
    }

    /// Release the lock held by `job`. Unlocking an unheld key is a no-op;
    /// unlocking another job's lock is rejected with the holder.
    pub fn unlock(&mut self, key: &Key, job: &JobId) -> Result<(), JobId> {
        match self.holders.get(key) {
            Some(holder) if holder != job => Err(holder.clone()),
            Some(_) => {
                self.holders.remove(key);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Whether `job` may structurally mutate `key`
    pub fn permits(&self, key: &Key, job: Option<&JobId>) -> Result<(), JobId> {
        match self.holders.get(key) {
            Some(holder) if Some(holder) != job => Err(holder.clone()),
            _ => Ok(()),
        }
    }

    /// Drop every lock held by `job`; returns how many were released
    pub fn release_job(&mut self, job: &JobId) -> usize {
        let before = self.holders.len();
        self.holders.retain(|_, holder| holder != job);
        before - self.holders.len()
    }
}
