//! Derived progress snapshot for UI consumers.

use serde::{Deserialize, Serialize};

use crate::queue::{Job, JobState};

/// Aggregate counters recomputable from the job set at any time. Never a
/// source of truth; readers accept staleness.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    /// Label of an item currently downloading, for display.
    pub current_item: Option<String>,
}

impl ProgressSnapshot {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut snapshot = ProgressSnapshot {
            total: jobs.len(),
            ..ProgressSnapshot::default()
        };
        for job in jobs {
            match job.state {
                JobState::Completed => snapshot.completed += 1,
                JobState::Failed | JobState::Cancelled => snapshot.failed += 1,
                JobState::Active => {
                    snapshot.in_progress += 1;
                    if snapshot.current_item.is_none() {
                        snapshot.current_item = Some(display_label(job));
                    }
                }
                JobState::Pending => {}
            }
        }
        snapshot
    }
}

/// Human-readable label: the payload's display name when present, else the
/// destination hint.
fn display_label(job: &Job) -> String {
    job.payload
        .get("displayName")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| job.destination_hint.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(state: JobState, payload: serde_json::Value) -> Job {
        Job {
            id: "j".into(),
            file_id: "f".into(),
            payload,
            destination_hint: "week1/notes.pdf".into(),
            state,
            retry_count: 0,
            max_retries: 3,
            created_at_ms: 0,
            started_at_ms: None,
            completed_at_ms: None,
            error: None,
            bytes_downloaded: 0,
            total_bytes: None,
            not_before_ms: None,
        }
    }

    #[test]
    fn counts_and_label() {
        let jobs = vec![
            job(JobState::Completed, json!({})),
            job(JobState::Active, json!({"displayName": "lecture.mp4"})),
            job(JobState::Pending, json!({})),
            job(JobState::Failed, json!({})),
            job(JobState::Cancelled, json!({})),
        ];
        let s = ProgressSnapshot::from_jobs(&jobs);
        assert_eq!(s.total, 5);
        assert_eq!(s.completed, 1);
        assert_eq!(s.failed, 2);
        assert_eq!(s.in_progress, 1);
        assert_eq!(s.current_item.as_deref(), Some("lecture.mp4"));
    }

    #[test]
    fn label_falls_back_to_destination_hint() {
        let jobs = vec![job(JobState::Active, json!({}))];
        let s = ProgressSnapshot::from_jobs(&jobs);
        assert_eq!(s.current_item.as_deref(), Some("week1/notes.pdf"));
    }
}
