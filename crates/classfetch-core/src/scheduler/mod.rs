//! Rate-limited, crash-tolerant download scheduler.
//!
//! Pulls ready jobs FIFO, holds at most the configured number in flight,
//! gates every executor call behind the rate limiter, and records terminal
//! results atomically. A restarted process recovers interrupted jobs before
//! scheduling and defers entirely when another live instance holds the
//! scheduler-owner lock.

mod finish;
mod heartbeat;
mod progress;
mod run;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

use crate::config::ClassfetchConfig;
use crate::control::{AbortFlag, JobControl};
use crate::executor::DownloadExecutor;
use crate::limiter::RateLimiter;
use crate::lock::{LockToken, StoreLock};
use crate::queue::{Job, JobQueue, OfflineQueue, QueueCounts};
use crate::store::SessionStore;

pub use heartbeat::HeartbeatReport;
pub use progress::ProgressSnapshot;
pub use run::RunOutcome;

/// Terminal result delivered to an `enqueue` caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        bytes_written: u64,
    },
    /// The job reached `failed`; `retryable` tells the caller whether
    /// re-enqueueing could help.
    Failed {
        error: String,
        retryable: bool,
    },
    /// Parked in the offline queue after exhausting transient retries.
    Offline {
        reason: String,
    },
    Cancelled,
}

/// Handle returned by `enqueue`; resolves once the job leaves the queue.
pub struct JobTicket {
    pub job: Job,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    /// Wait for the job to reach a terminal state. Errs only when the
    /// scheduler was dropped before the job finished.
    pub async fn wait(self) -> Result<JobOutcome> {
        self.rx
            .await
            .map_err(|_| anyhow::anyhow!("scheduler dropped before job finished"))
    }
}

/// Marker describing the operation currently driving the scheduler. A
/// stale marker (older than the operation TTL with no loop running) is
/// evidence of a crashed instance and is cleared by the heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct OperationMarker {
    pub id: String,
    pub started_at_ms: i64,
}

/// Scheduler context object: owns every subsystem handle, constructed once
/// at startup and threaded through all operations. No global mutable state,
/// so tests can run independent instances side by side.
pub struct Scheduler {
    pub(crate) store: SessionStore,
    pub(crate) queue: JobQueue,
    pub(crate) offline: OfflineQueue,
    pub(crate) limiter: RateLimiter,
    pub(crate) lock: StoreLock,
    pub(crate) cfg: ClassfetchConfig,
    pub(crate) executor: Arc<dyn DownloadExecutor>,
    pub(crate) abort: AbortFlag,
    pub(crate) control: JobControl,
    /// Process-local re-entrancy guard for the loop. Resets to false on
    /// restart, which is why the owner lock exists as well.
    pub(crate) running: AtomicBool,
    /// Owner-lock token while the loop runs; renewed from the loop itself
    /// and by the heartbeat.
    pub(crate) owner_token: Mutex<Option<LockToken>>,
    /// Set when an owner-lock renewal finds the lock gone; the loop stops
    /// activating jobs.
    pub(crate) owner_lost: AtomicBool,
    pub(crate) waiters: Mutex<HashMap<String, oneshot::Sender<JobOutcome>>>,
}

impl Scheduler {
    pub fn new(
        store: SessionStore,
        cfg: ClassfetchConfig,
        executor: Arc<dyn DownloadExecutor>,
    ) -> Self {
        let lock = StoreLock::new(store.clone(), cfg.lock.timeout(), cfg.lock.retry_step());
        let queue = JobQueue::new(store.clone(), lock.clone(), cfg.lock.max_retries);
        let offline = OfflineQueue::new(
            store.clone(),
            lock.clone(),
            cfg.offline.capacity,
            cfg.lock.max_retries,
        );
        let limiter = RateLimiter::new(store.clone(), cfg.limiter.to_limiter_config());
        let abort = AbortFlag::new(store.clone());
        Self {
            store,
            queue,
            offline,
            limiter,
            lock,
            cfg,
            executor,
            abort,
            control: JobControl::new(),
            running: AtomicBool::new(false),
            owner_token: Mutex::new(None),
            owner_lost: AtomicBool::new(false),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue one attachment for download. The returned ticket resolves
    /// when the job reaches a terminal state (or is parked offline).
    pub async fn enqueue(
        &self,
        file_id: &str,
        payload: serde_json::Value,
        destination_hint: &str,
    ) -> Result<JobTicket> {
        let job = self
            .queue
            .add_job(
                file_id,
                payload,
                destination_hint,
                self.cfg.scheduler.max_retries,
            )
            .await?;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(job.id.clone(), tx);
        Ok(JobTicket { job, rx })
    }

    /// Halt scheduling and cancel every queued or in-flight job. The abort
    /// is persisted first so it survives a restart; in-flight downloads are
    /// signalled through their cancel tokens, not preempted.
    pub async fn cancel_all(&self) -> Result<()> {
        self.abort.set().await?;
        self.control.cancel_all();
        let cancelled = self.queue.cancel_all().await?;
        for job in &cancelled {
            self.resolve_waiter(&job.id, JobOutcome::Cancelled).await;
        }
        self.write_progress().await?;
        tracing::info!(count = cancelled.len(), "cancelled all jobs");
        Ok(())
    }

    /// Re-arm the scheduler after a completed or cancelled operation.
    pub async fn clear_abort(&self) -> Result<()> {
        self.abort.clear().await?;
        Ok(())
    }

    /// Per-state counts (unlocked snapshot; may be stale).
    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        self.queue.counts_by_state().await
    }

    /// Recompute the progress snapshot from the job set.
    pub async fn progress_snapshot(&self) -> Result<ProgressSnapshot> {
        Ok(ProgressSnapshot::from_jobs(&self.queue.jobs().await?))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) async fn resolve_waiter(&self, job_id: &str, outcome: JobOutcome) {
        if let Some(tx) = self.waiters.lock().await.remove(job_id) {
            // The caller may have dropped the ticket; nothing to deliver to.
            let _ = tx.send(outcome);
        }
    }

    /// Persist the derived progress snapshot. Allowed to be stale; job
    /// state transitions are the synchronous, correctness-critical writes.
    pub(crate) async fn write_progress(&self) -> Result<()> {
        let snapshot = self.progress_snapshot().await?;
        self.store
            .set_json(crate::store::keys::PROGRESS, &snapshot)
            .await?;
        Ok(())
    }
}
