//! Periodic heartbeat: orphan cleanup, stale-marker detection, owner-lock
//! renewal, and resume advice.
//!
//! The host owns the timer; it calls `heartbeat()` on every firing. The
//! scheduler never installs timers of its own, so a suspended process
//! simply stops heartbeating and its locks age out.

use std::time::Duration;

use anyhow::Result;

use crate::store::{keys, unix_millis};

use super::{JobOutcome, OperationMarker, Scheduler};

/// What one heartbeat tick found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Orphaned jobs evicted past the TTL.
    pub evicted: usize,
    /// A stale current-operation marker was cleared.
    pub cleared_stale_operation: bool,
    /// Pending or active jobs exist and no loop is running here: the
    /// caller should invoke `start()` to resume.
    pub should_resume: bool,
}

impl Scheduler {
    /// One heartbeat tick.
    pub async fn heartbeat(&self) -> Result<HeartbeatReport> {
        let mut report = HeartbeatReport::default();

        // TTL eviction: a blunt safety valve against records orphaned by a
        // permanently crashed caller.
        let ttl = Duration::from_secs(self.cfg.scheduler.job_ttl_secs);
        let evicted = self.queue.evict_expired(ttl).await?;
        report.evicted = evicted.len();
        for job in &evicted {
            self.resolve_waiter(
                &job.id,
                JobOutcome::Failed {
                    error: "evicted: exceeded queue TTL without finishing".to_string(),
                    retryable: true,
                },
            )
            .await;
        }

        report.cleared_stale_operation = self.clear_stale_operation().await?;

        // Keep the owner lock fresh while our loop runs so another
        // instance's heartbeat doesn't seize it mid-operation.
        if self.is_running() {
            self.renew_owner().await?;
        }

        let counts = self.queue.counts_by_state().await?;
        report.should_resume =
            (counts.pending > 0 || counts.active > 0) && !self.is_running() && !self.abort.is_set();

        if report.evicted > 0 || report.cleared_stale_operation {
            self.write_progress().await?;
        }
        Ok(report)
    }

    /// Clear a current-operation marker left behind by a crashed instance.
    /// Only markers older than the operation TTL are touched, and never
    /// while our own loop is running (that marker is ours).
    async fn clear_stale_operation(&self) -> Result<bool> {
        if self.is_running() {
            return Ok(false);
        }
        let Some(marker) = self
            .store
            .get_json::<OperationMarker>(keys::CURRENT_OPERATION)
            .await?
        else {
            return Ok(false);
        };
        let age_ms = unix_millis().saturating_sub(marker.started_at_ms);
        let ttl_ms = self.cfg.scheduler.operation_ttl_secs as i64 * 1000;
        if age_ms <= ttl_ms {
            return Ok(false);
        }
        self.store.remove(keys::CURRENT_OPERATION).await?;
        tracing::warn!(operation = %marker.id, age_ms, "cleared stale operation marker");
        Ok(true)
    }
}
