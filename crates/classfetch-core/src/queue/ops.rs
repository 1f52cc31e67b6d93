//! Job queue operations over the session store.

use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

use crate::lock::{atomic_update, StoreLock};
use crate::store::{keys, unix_millis, SessionStore};

use super::types::{Job, JobPatch, JobState, QueueCounts};

/// Durable FIFO queue of download jobs.
#[derive(Clone)]
pub struct JobQueue {
    store: SessionStore,
    lock: StoreLock,
    lock_retries: u32,
}

impl JobQueue {
    pub fn new(store: SessionStore, lock: StoreLock, lock_retries: u32) -> Self {
        Self {
            store,
            lock,
            lock_retries,
        }
    }

    /// Atomically append a new `pending` job and return the created record.
    pub async fn add_job(
        &self,
        file_id: &str,
        payload: serde_json::Value,
        destination_hint: &str,
        max_retries: u32,
    ) -> Result<Job> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            file_id: file_id.to_string(),
            payload,
            destination_hint: destination_hint.to_string(),
            state: JobState::Pending,
            retry_count: 0,
            max_retries,
            created_at_ms: unix_millis(),
            started_at_ms: None,
            completed_at_ms: None,
            error: None,
            bytes_downloaded: 0,
            total_bytes: None,
            not_before_ms: None,
        };
        let appended = job.clone();
        atomic_update(&self.lock, keys::QUEUE, self.lock_retries, move |mut jobs: Vec<Job>| {
            jobs.push(appended);
            Ok(jobs)
        })
        .await?;
        tracing::debug!(job_id = %job.id, file_id = %job.file_id, "job enqueued");
        Ok(job)
    }

    /// Atomically merge `patch` into the job with the given id.
    ///
    /// Returns `None` when the job is absent: TTL eviction can race an
    /// in-flight update, so callers treat this as "job vanished", not as an
    /// error.
    pub async fn update_job(&self, id: &str, patch: JobPatch) -> Result<Option<Job>> {
        let mut updated: Option<Job> = None;
        atomic_update(&self.lock, keys::QUEUE, self.lock_retries, |mut jobs: Vec<Job>| {
            if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
                patch.apply(job);
                updated = Some(job.clone());
            }
            Ok(jobs)
        })
        .await?;
        Ok(updated)
    }

    /// Compare-and-set activation: mark the job `active` only if it is
    /// still `pending` inside the atomic closure. Returns `None` when it
    /// was cancelled, claimed elsewhere, or evicted in the meantime.
    pub async fn claim_pending(&self, id: &str) -> Result<Option<Job>> {
        let now = unix_millis();
        let mut claimed: Option<Job> = None;
        atomic_update(&self.lock, keys::QUEUE, self.lock_retries, |mut jobs: Vec<Job>| {
            if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
                if job.state == JobState::Pending {
                    job.state = JobState::Active;
                    job.started_at_ms = Some(now);
                    claimed = Some(job.clone());
                }
            }
            Ok(jobs)
        })
        .await?;
        Ok(claimed)
    }

    /// Unlocked point read of one job. May be stale.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs().await?.into_iter().find(|j| j.id == id))
    }

    /// First job in insertion order with state `pending` whose retry delay
    /// (if any) has elapsed. FIFO; any prioritization happens in the rate
    /// limiter, never here.
    pub async fn next_pending_job(&self) -> Result<Option<Job>> {
        let now = unix_millis();
        Ok(self.jobs().await?.into_iter().find(|j| {
            j.state == JobState::Pending && j.not_before_ms.map_or(true, |t| t <= now)
        }))
    }

    /// Per-state counts used for the concurrency-ceiling check.
    pub async fn counts_by_state(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for job in self.jobs().await? {
            match job.state {
                JobState::Pending => counts.pending += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    /// Unlocked snapshot of the whole queue.
    pub async fn jobs(&self) -> Result<Vec<Job>> {
        Ok(self.store.get_json(keys::QUEUE).await?.unwrap_or_default())
    }

    /// Restart recovery: demote every `active` job to `pending`, increment
    /// its retry count, and clear `started_at`.
    ///
    /// Runs without the lock. The caller must invoke this once at process
    /// start, before any scheduler loop runs, so nothing mutates the queue
    /// concurrently.
    pub async fn reset_active_jobs(&self) -> Result<u64> {
        let mut jobs = self.jobs().await?;
        let mut reset = 0u64;
        for job in jobs.iter_mut() {
            if job.state == JobState::Active {
                job.state = JobState::Pending;
                job.retry_count += 1;
                job.started_at_ms = None;
                reset += 1;
            }
        }
        if reset > 0 {
            self.store.set_json(keys::QUEUE, &jobs).await?;
            tracing::info!(count = reset, "recovered interrupted jobs after restart");
        }
        Ok(reset)
    }

    /// Remove `pending`/`active` jobs whose age exceeds `ttl`. A blunt
    /// safety valve against records orphaned by a permanently crashed
    /// caller, not a retry mechanism. Returns the evicted jobs.
    pub async fn evict_expired(&self, ttl: Duration) -> Result<Vec<Job>> {
        let cutoff = unix_millis() - ttl.as_millis() as i64;
        let mut evicted = Vec::new();
        atomic_update(&self.lock, keys::QUEUE, self.lock_retries, |jobs: Vec<Job>| {
            let mut kept = Vec::with_capacity(jobs.len());
            for job in jobs {
                let orphaned = matches!(job.state, JobState::Pending | JobState::Active)
                    && job.created_at_ms < cutoff;
                if orphaned {
                    evicted.push(job);
                } else {
                    kept.push(job);
                }
            }
            Ok(kept)
        })
        .await?;
        for job in &evicted {
            tracing::warn!(job_id = %job.id, state = job.state.as_str(), "evicted orphaned job past TTL");
        }
        Ok(evicted)
    }

    /// Atomically remove one job (used when diverting to the offline
    /// queue). Returns the removed record, if it was still present.
    pub async fn remove_job(&self, id: &str) -> Result<Option<Job>> {
        let mut removed: Option<Job> = None;
        atomic_update(&self.lock, keys::QUEUE, self.lock_retries, |mut jobs: Vec<Job>| {
            if let Some(pos) = jobs.iter().position(|j| j.id == id) {
                removed = Some(jobs.remove(pos));
            }
            Ok(jobs)
        })
        .await?;
        Ok(removed)
    }

    /// Move every non-terminal job to `cancelled`. Returns the jobs that
    /// changed state.
    pub async fn cancel_all(&self) -> Result<Vec<Job>> {
        let now = unix_millis();
        let mut cancelled = Vec::new();
        atomic_update(&self.lock, keys::QUEUE, self.lock_retries, |mut jobs: Vec<Job>| {
            for job in jobs.iter_mut() {
                if !job.state.is_terminal() {
                    job.state = JobState::Cancelled;
                    job.completed_at_ms = Some(now);
                    cancelled.push(job.clone());
                }
            }
            Ok(jobs)
        })
        .await?;
        Ok(cancelled)
    }

    /// Drop the whole queue.
    pub async fn clear(&self) -> Result<()> {
        self.store.remove(keys::QUEUE).await?;
        Ok(())
    }
}
