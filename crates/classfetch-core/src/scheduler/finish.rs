//! Terminal-state recording and failure routing for finished jobs.

use anyhow::Result;

use crate::executor::{DownloadError, DownloadOutcome};
use crate::queue::{Job, JobPatch, JobState};
use crate::store::unix_millis;

use super::{JobOutcome, Scheduler};

impl Scheduler {
    /// Route one finished download: record the terminal state atomically,
    /// update limiter/backoff bookkeeping, park offline when transient
    /// retries are exhausted, and resolve the enqueuer's ticket.
    pub(super) async fn finish(
        &self,
        job: Job,
        result: Result<DownloadOutcome, DownloadError>,
    ) -> Result<()> {
        self.control.unregister(&job.id);

        match result {
            Ok(outcome) => self.finish_completed(&job, outcome).await?,
            Err(DownloadError::RateLimited { retry_after }) => {
                self.finish_rate_limited(&job, retry_after.as_deref()).await?
            }
            Err(DownloadError::Network(reason)) => self.finish_network(&job, &reason).await?,
            Err(DownloadError::Aborted) => self.finish_aborted(&job).await?,
            Err(err) => self.finish_permanent(&job, err).await?,
        }

        self.write_progress().await?;
        Ok(())
    }

    async fn finish_completed(&self, job: &Job, outcome: DownloadOutcome) -> Result<()> {
        let patch = JobPatch {
            state: Some(JobState::Completed),
            completed_at_ms: Some(unix_millis()),
            bytes_downloaded: Some(outcome.bytes_written),
            total_bytes: Some(outcome.bytes_written),
            ..JobPatch::default()
        };
        self.queue.update_job(&job.id, patch).await?;
        // Any success closes an open backoff window.
        self.limiter.clear_backoff(None).await?;
        tracing::info!(job_id = %job.id, bytes = outcome.bytes_written, "job completed");
        self.resolve_waiter(
            &job.id,
            JobOutcome::Completed {
                bytes_written: outcome.bytes_written,
            },
        )
        .await;
        Ok(())
    }

    /// Throttled: open a backoff window and requeue without charging a
    /// retry. The limiter transparently delays the next attempt.
    async fn finish_rate_limited(&self, job: &Job, hint: Option<&str>) -> Result<()> {
        self.limiter.report_429(None, hint).await?;
        let patch = JobPatch {
            state: Some(JobState::Pending),
            clear_started_at: true,
            ..JobPatch::default()
        };
        self.queue.update_job(&job.id, patch).await?;
        tracing::debug!(job_id = %job.id, "requeued after rate limit");
        Ok(())
    }

    /// Transient connectivity failure: retry with an increasing delay
    /// until the retry budget is spent, then park in the offline queue and
    /// drop from the main queue.
    async fn finish_network(&self, job: &Job, reason: &str) -> Result<()> {
        let attempts = job.retry_count + 1;
        if attempts >= job.max_retries {
            if self.queue.remove_job(&job.id).await?.is_some() {
                self.offline
                    .push(
                        &job.file_id,
                        job.payload.clone(),
                        &job.destination_hint,
                        reason,
                        attempts,
                    )
                    .await?;
            }
            tracing::warn!(job_id = %job.id, attempts, "retries exhausted; parked offline");
            self.resolve_waiter(
                &job.id,
                JobOutcome::Offline {
                    reason: reason.to_string(),
                },
            )
            .await;
            return Ok(());
        }

        let delay_ms = self.cfg.scheduler.retry_delay_ms * u64::from(attempts);
        let patch = JobPatch {
            state: Some(JobState::Pending),
            retry_count: Some(attempts),
            clear_started_at: true,
            error: Some(reason.to_string()),
            not_before_ms: Some(unix_millis() + delay_ms as i64),
            ..JobPatch::default()
        };
        self.queue.update_job(&job.id, patch).await?;
        tracing::debug!(job_id = %job.id, attempts, delay_ms, "transient failure; will retry");
        Ok(())
    }

    async fn finish_aborted(&self, job: &Job) -> Result<()> {
        let patch = JobPatch {
            state: Some(JobState::Cancelled),
            completed_at_ms: Some(unix_millis()),
            ..JobPatch::default()
        };
        self.queue.update_job(&job.id, patch).await?;
        tracing::debug!(job_id = %job.id, "job honored cancellation");
        self.resolve_waiter(&job.id, JobOutcome::Cancelled).await;
        Ok(())
    }

    /// Permanent failures (not found, forbidden, auth, unclassified) are
    /// recorded immediately and never retried.
    async fn finish_permanent(&self, job: &Job, err: DownloadError) -> Result<()> {
        let message = err.to_string();
        let patch = JobPatch {
            state: Some(JobState::Failed),
            completed_at_ms: Some(unix_millis()),
            error: Some(message.clone()),
            ..JobPatch::default()
        };
        self.queue.update_job(&job.id, patch).await?;
        tracing::warn!(job_id = %job.id, error = %message, "job failed permanently");
        self.resolve_waiter(
            &job.id,
            JobOutcome::Failed {
                error: message,
                retryable: err.is_retryable(),
            },
        )
        .await;
        Ok(())
    }
}
