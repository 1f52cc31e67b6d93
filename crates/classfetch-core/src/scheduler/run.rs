//! The scheduler loop: ownership, recovery, claim-and-spawn dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::executor::{DownloadError, DownloadOutcome};
use crate::queue::Job;
use crate::store::{keys, unix_millis};

use super::{OperationMarker, Scheduler};

/// How one `run` invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Queue drained (or abort honored); `processed` jobs reached a
    /// terminal state or were parked offline.
    Finished { processed: usize },
    /// Another live process instance holds the scheduler-owner lock.
    Deferred,
    /// This instance already has a loop running.
    AlreadyRunning,
    /// A persisted abort was set before any scheduling happened.
    Aborted,
}

/// Default rate-limiter priority for download requests; a payload may
/// carry an explicit `priority` to jump the limiter queue.
const DEFAULT_PRIORITY: u8 = 5;

fn job_priority(job: &Job) -> u8 {
    job.payload
        .get("priority")
        .and_then(|v| v.as_u64())
        .map(|p| p.min(u8::MAX as u64) as u8)
        .unwrap_or(DEFAULT_PRIORITY)
}

/// Watch a cancel token. Coarse polling is enough: cancellation only has
/// to beat backoff windows and token waits, not individual grants.
async fn wait_for_cancel(flag: &AtomicBool) {
    while !flag.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

impl Scheduler {
    /// Full startup sequence: load the persisted abort flag, then run the
    /// loop. This is the entry point a fresh process instance uses.
    pub async fn start(&self) -> Result<RunOutcome> {
        if self.abort.load_persisted().await? {
            tracing::info!("persisted abort flag set; not scheduling");
            return Ok(RunOutcome::Aborted);
        }
        self.run().await
    }

    /// Run the scheduler loop until the queue drains or an abort lands.
    ///
    /// Guarded twice: the in-memory running flag stops re-entry within
    /// this process, and the scheduler-owner lock stops a second process
    /// instance (whose own flag reset on restart) from double-processing.
    /// Everything that touches the queue, recovery included, happens only
    /// after the owner lock is held.
    pub async fn run(&self) -> Result<RunOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(RunOutcome::AlreadyRunning);
        }
        let result = self.run_guarded().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_guarded(&self) -> Result<RunOutcome> {
        let Some(owner) = self.lock.try_acquire(keys::SCHEDULER_OWNER).await? else {
            tracing::info!("another scheduler instance owns the loop; deferring");
            return Ok(RunOutcome::Deferred);
        };
        *self.owner_token.lock().await = Some(owner);
        self.owner_lost.store(false, Ordering::SeqCst);

        let outcome = self.run_owned().await;

        // Release the owner lock before surfacing any error from the loop
        // or its cleanup; a store hiccup must not leak the lock until its
        // timeout.
        let cleanup = self.store.remove(keys::CURRENT_OPERATION).await;
        if let Some(owner) = self.owner_token.lock().await.take() {
            self.lock.release(keys::SCHEDULER_OWNER, &owner).await?;
        }
        cleanup?;
        outcome
    }

    async fn run_owned(&self) -> Result<RunOutcome> {
        // Recovery runs under the owner lock: demoting another live
        // instance's active jobs would double-process them.
        self.queue.reset_active_jobs().await?;

        let marker = OperationMarker {
            id: Uuid::new_v4().to_string(),
            started_at_ms: unix_millis(),
        };
        self.store.set_json(keys::CURRENT_OPERATION, &marker).await?;

        self.run_loop().await
    }

    async fn run_loop(&self) -> Result<RunOutcome> {
        let ceiling = self.cfg.scheduler.max_concurrent.max(1);
        let poll = Duration::from_millis(self.cfg.scheduler.poll_interval_ms);
        // Renew well inside the lock timeout so a live loop is never
        // mistaken for a crashed holder and seized.
        let renew_every = (self.cfg.lock.timeout() / 2).max(Duration::from_millis(50));
        let mut renew = tokio::time::interval(renew_every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await;

        let mut in_flight: JoinSet<(Job, Result<DownloadOutcome, DownloadError>)> = JoinSet::new();
        let mut processed = 0usize;

        loop {
            // The abort flag and a lost owner lock both halt activation
            // between jobs; whatever is already in flight finishes (or
            // honors its cancel token).
            if !self.abort.is_set() && !self.owner_lost.load(Ordering::SeqCst) {
                while in_flight.len() < ceiling && !self.abort.is_set() {
                    let counts = self.queue.counts_by_state().await?;
                    if counts.active > in_flight.len() {
                        // Active jobs we did not spawn belong to a dead
                        // instance; the heartbeat TTL will collect them.
                        break;
                    }
                    let Some(job) = self.queue.next_pending_job().await? else {
                        break;
                    };
                    match self.queue.claim_pending(&job.id).await? {
                        Some(claimed) => self.spawn_job(&mut in_flight, claimed),
                        // No longer pending: cancelled, claimed elsewhere,
                        // or evicted between snapshot and claim.
                        None => continue,
                    }
                }
            }

            if in_flight.is_empty() {
                let more = !self.abort.is_set()
                    && !self.owner_lost.load(Ordering::SeqCst)
                    && self.queue.counts_by_state().await?.pending > 0;
                if more {
                    // All pending jobs are waiting out retry delays.
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = renew.tick() => self.renew_owner().await?,
                    }
                    continue;
                }
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    let (job, result) =
                        joined.map_err(|e| anyhow::anyhow!("job task join: {e}"))?;
                    self.finish(job, result).await?;
                    processed += 1;
                }
                _ = renew.tick() => self.renew_owner().await?,
            }
        }

        tracing::info!(processed, "scheduler loop finished");
        Ok(RunOutcome::Finished { processed })
    }

    /// Refresh the owner lock's age. A failed renewal means another
    /// instance seized the loop; this one stops activating jobs.
    pub(super) async fn renew_owner(&self) -> Result<()> {
        let token = self.owner_token.lock().await.clone();
        let Some(token) = token else {
            return Ok(());
        };
        if !self.lock.renew(keys::SCHEDULER_OWNER, &token).await? {
            tracing::warn!("scheduler-owner lock lost; halting job activation");
            self.owner_lost.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn spawn_job(
        &self,
        in_flight: &mut JoinSet<(Job, Result<DownloadOutcome, DownloadError>)>,
        job: Job,
    ) {
        let limiter = self.limiter.clone();
        let executor = Arc::clone(&self.executor);
        let cancel = self.control.register(&job.id);
        let priority = job_priority(&job);
        tracing::debug!(job_id = %job.id, file_id = %job.file_id, priority, "job activated");

        in_flight.spawn(async move {
            // The executor call sits inside the limiter's acquire: no
            // request leaves without a token. The wait itself honors
            // cancellation so an abort is not stuck behind a backoff
            // window.
            let granted = tokio::select! {
                res = limiter.acquire(None, priority) => res,
                _ = wait_for_cancel(&cancel) => {
                    return (job, Err(DownloadError::Aborted));
                }
            };
            if let Err(e) = granted {
                return (job, Err(DownloadError::Other(format!("rate limiter: {e}"))));
            }
            let result = executor
                .download(&job.payload, &job.destination_hint, Arc::clone(&cancel))
                .await;
            (job, result)
        });
    }
}
