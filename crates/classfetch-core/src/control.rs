//! Abort control: a persisted global flag plus per-job cancel tokens.
//!
//! The global flag lives in the store so an abort requested just before a
//! process restart still halts the next instance. The scheduler checks it
//! between job activations; it never preempts an in-flight download — the
//! per-job token passed to the executor covers that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;

use crate::store::{keys, SessionStore};

/// Process-wide abort flag mirrored in memory for cheap checks.
pub struct AbortFlag {
    store: SessionStore,
    flag: AtomicBool,
}

impl AbortFlag {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            flag: AtomicBool::new(false),
        }
    }

    /// Pick up a persisted abort from before a restart. Call once at
    /// process start before scheduling.
    pub async fn load_persisted(&self) -> Result<bool> {
        let aborted = self.store.get(keys::ABORT_FLAG).await?.is_some();
        self.flag.store(aborted, Ordering::Relaxed);
        Ok(aborted)
    }

    /// Request abort: persist first, then flip the in-memory mirror, so a
    /// crash between the two still aborts after restart.
    pub async fn set(&self) -> Result<()> {
        self.store.set(keys::ABORT_FLAG, "1").await?;
        self.flag.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Clear the flag (new operation starting).
    pub async fn clear(&self) -> Result<()> {
        self.store.remove(keys::ABORT_FLAG).await?;
        self.flag.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Registry of job id -> cancel token. The scheduler registers each job it
/// activates and hands the token to the executor; `cancel_all` trips every
/// registered token.
#[derive(Default)]
pub struct JobControl {
    jobs: RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activating job; returns the token to pass to the
    /// download executor.
    pub fn register(&self, job_id: &str) -> Arc<AtomicBool> {
        let token = Arc::new(AtomicBool::new(false));
        self.jobs
            .write()
            .unwrap()
            .insert(job_id.to_string(), Arc::clone(&token));
        token
    }

    /// Unregister when the job finishes, success or failure.
    pub fn unregister(&self, job_id: &str) {
        self.jobs.write().unwrap().remove(job_id);
    }

    /// Trip every in-flight job's cancel token.
    pub fn cancel_all(&self) {
        for token in self.jobs.read().unwrap().values() {
            token.store(true, Ordering::Relaxed);
        }
    }
}
