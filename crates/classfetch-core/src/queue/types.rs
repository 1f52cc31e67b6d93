//! Job record, lifecycle states, and patch type.

use serde::{Deserialize, Serialize};

/// Lifecycle of a download job.
///
/// `pending → active → {completed | failed}`; `active → pending` only via
/// restart recovery; any state `→ cancelled` on explicit cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// One durable unit of download work.
///
/// `id` is unique per enqueue, not per file, so the same file may be queued
/// again. The payload is an opaque attachment descriptor owned by the
/// download executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub file_id: String,
    pub payload: serde_json::Value,
    pub destination_hint: String,
    pub state: JobState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub error: Option<String>,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    /// Earliest time the job may be activated again (transient-failure
    /// retry delay). `None` means immediately eligible.
    #[serde(default)]
    pub not_before_ms: Option<i64>,
}

/// Field-wise merge applied by `update_job`. Applying the same patch twice
/// yields the same record as applying it once.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub retry_count: Option<u32>,
    pub started_at_ms: Option<i64>,
    /// Requeueing a job clears its activation timestamp.
    pub clear_started_at: bool,
    pub completed_at_ms: Option<i64>,
    pub error: Option<String>,
    pub bytes_downloaded: Option<u64>,
    pub total_bytes: Option<u64>,
    pub not_before_ms: Option<i64>,
}

impl JobPatch {
    pub(crate) fn apply(&self, job: &mut Job) {
        if let Some(state) = self.state {
            // Terminal states never transition again; a cancel that races
            // a claim or a late finish must not resurrect the job.
            if !job.state.is_terminal() {
                job.state = state;
            }
        }
        if let Some(retry_count) = self.retry_count {
            job.retry_count = retry_count;
        }
        if let Some(started) = self.started_at_ms {
            job.started_at_ms = Some(started);
        }
        if self.clear_started_at {
            job.started_at_ms = None;
        }
        if let Some(not_before) = self.not_before_ms {
            job.not_before_ms = Some(not_before);
        }
        if let Some(completed) = self.completed_at_ms {
            job.completed_at_ms = Some(completed);
        }
        if let Some(error) = &self.error {
            job.error = Some(error.clone());
        }
        if let Some(bytes) = self.bytes_downloaded {
            job.bytes_downloaded = bytes;
        }
        if let Some(total) = self.total_bytes {
            job.total_bytes = Some(total);
        }
    }
}

/// Per-state counts from one O(n) scan. Job lists are small (bounded by
/// one course's attachment count), so the scan is fine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.active + self.completed + self.failed + self.cancelled
    }
}
