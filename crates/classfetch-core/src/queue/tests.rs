//! Queue and offline-ring tests over the in-memory store.

use std::time::Duration;

use serde_json::json;

use crate::lock::StoreLock;
use crate::queue::{JobPatch, JobQueue, JobState, OfflineQueue};
use crate::store::SessionStore;

async fn queue() -> (SessionStore, JobQueue) {
    let store = SessionStore::open_memory().await.unwrap();
    let lock = StoreLock::new(
        store.clone(),
        Duration::from_secs(2),
        Duration::from_millis(10),
    );
    (store.clone(), JobQueue::new(store, lock, 10))
}

#[tokio::test]
async fn add_job_starts_pending() {
    let (_, q) = queue().await;
    let job = q
        .add_job("file-1", json!({"name": "syllabus.pdf"}), "week1/", 3)
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.retry_count, 0);
    assert!(job.started_at_ms.is_none());

    let stored = q.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.file_id, "file-1");
    assert_eq!(stored.destination_hint, "week1/");
}

#[tokio::test]
async fn same_file_can_be_queued_twice() {
    let (_, q) = queue().await;
    let a = q.add_job("file-1", json!({}), "x", 3).await.unwrap();
    let b = q.add_job("file-1", json!({}), "x", 3).await.unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(q.counts_by_state().await.unwrap().pending, 2);
}

#[tokio::test]
async fn next_pending_is_fifo() {
    let (_, q) = queue().await;
    let first = q.add_job("a", json!({}), "x", 3).await.unwrap();
    let second = q.add_job("b", json!({}), "x", 3).await.unwrap();

    assert_eq!(q.next_pending_job().await.unwrap().unwrap().id, first.id);

    q.update_job(
        &first.id,
        JobPatch {
            state: Some(JobState::Active),
            ..JobPatch::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(q.next_pending_job().await.unwrap().unwrap().id, second.id);
}

#[tokio::test]
async fn update_job_merges_and_is_idempotent() {
    let (_, q) = queue().await;
    let job = q.add_job("a", json!({}), "x", 3).await.unwrap();

    let patch = JobPatch {
        state: Some(JobState::Active),
        started_at_ms: Some(1_000),
        bytes_downloaded: Some(42),
        ..JobPatch::default()
    };
    let once = q.update_job(&job.id, patch.clone()).await.unwrap().unwrap();
    let twice = q.update_job(&job.id, patch).await.unwrap().unwrap();

    assert_eq!(once.state, JobState::Active);
    assert_eq!(once.bytes_downloaded, 42);
    assert_eq!(once.started_at_ms, Some(1_000));
    // Merge semantics, not append: same patch, same record.
    assert_eq!(twice.state, once.state);
    assert_eq!(twice.bytes_downloaded, once.bytes_downloaded);
    assert_eq!(twice.retry_count, once.retry_count);
}

#[tokio::test]
async fn update_absent_job_is_a_no_op() {
    let (_, q) = queue().await;
    let result = q
        .update_job(
            "no-such-id",
            JobPatch {
                state: Some(JobState::Failed),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn reset_active_jobs_recovers_interrupted_work() {
    let (_, q) = queue().await;
    let mut ids = Vec::new();
    for i in 0..3 {
        let job = q.add_job(&format!("f{i}"), json!({}), "x", 3).await.unwrap();
        q.update_job(
            &job.id,
            JobPatch {
                state: Some(JobState::Active),
                started_at_ms: Some(123),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap();
        ids.push(job.id);
    }

    let reset = q.reset_active_jobs().await.unwrap();
    assert_eq!(reset, 3);
    for id in &ids {
        let job = q.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.started_at_ms.is_none());
    }

    // Nothing left active: re-running is a no-op.
    assert_eq!(q.reset_active_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn evict_expired_removes_only_old_non_terminal_jobs() {
    let (_, q) = queue().await;
    let old = q.add_job("old", json!({}), "x", 3).await.unwrap();
    let done = q.add_job("done", json!({}), "x", 3).await.unwrap();
    q.update_job(
        &done.id,
        JobPatch {
            state: Some(JobState::Completed),
            ..JobPatch::default()
        },
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let fresh = q.add_job("fresh", json!({}), "x", 3).await.unwrap();

    let evicted = q.evict_expired(Duration::from_millis(40)).await.unwrap();
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].id, old.id);

    // The completed job is past the TTL too but terminal states stay.
    let counts = q.counts_by_state().await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.completed, 1);
    assert!(q.get_job(&fresh.id).await.unwrap().is_some());
    assert!(q.get_job(&old.id).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_all_spares_terminal_jobs() {
    let (_, q) = queue().await;
    let pending = q.add_job("p", json!({}), "x", 3).await.unwrap();
    let done = q.add_job("d", json!({}), "x", 3).await.unwrap();
    q.update_job(
        &done.id,
        JobPatch {
            state: Some(JobState::Completed),
            ..JobPatch::default()
        },
    )
    .await
    .unwrap();

    let cancelled = q.cancel_all().await.unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, pending.id);

    let counts = q.counts_by_state().await.unwrap();
    assert_eq!(counts.cancelled, 1);
    assert_eq!(counts.completed, 1);
}

#[tokio::test]
async fn terminal_states_refuse_further_transitions() {
    let (_, q) = queue().await;
    let job = q.add_job("a", json!({}), "x", 3).await.unwrap();
    q.cancel_all().await.unwrap();

    // A late activation racing the cancel must not resurrect the job.
    let after = q
        .update_job(
            &job.id,
            JobPatch {
                state: Some(JobState::Active),
                started_at_ms: Some(1_000),
                ..JobPatch::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.state, JobState::Cancelled);
    // Non-state fields still merge.
    assert_eq!(after.started_at_ms, Some(1_000));
}

#[tokio::test]
async fn claim_pending_activates_only_pending_jobs() {
    let (_, q) = queue().await;
    let job = q.add_job("a", json!({}), "x", 3).await.unwrap();

    let claimed = q.claim_pending(&job.id).await.unwrap().unwrap();
    assert_eq!(claimed.state, JobState::Active);
    assert!(claimed.started_at_ms.is_some());

    // Already active: a second claim loses.
    assert!(q.claim_pending(&job.id).await.unwrap().is_none());

    // Cancelled between snapshot and claim: the claim loses too.
    let other = q.add_job("b", json!({}), "x", 3).await.unwrap();
    q.cancel_all().await.unwrap();
    assert!(q.claim_pending(&other.id).await.unwrap().is_none());
    assert_eq!(
        q.get_job(&other.id).await.unwrap().unwrap().state,
        JobState::Cancelled
    );
}

#[tokio::test]
async fn offline_ring_dedupes_and_bounds() {
    let store = SessionStore::open_memory().await.unwrap();
    let lock = StoreLock::new(
        store.clone(),
        Duration::from_secs(2),
        Duration::from_millis(10),
    );
    let offline = OfflineQueue::new(store, lock, 3, 10);

    for i in 0..4 {
        offline
            .push(&format!("f{i}"), json!({}), "x", "network", 3)
            .await
            .unwrap();
    }
    // Capacity 3: the oldest entry was evicted first.
    let entries = offline.entries().await.unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].file_id, "f1");

    // Re-pushing an existing file id replaces rather than grows.
    offline
        .push("f2", json!({}), "x", "network again", 4)
        .await
        .unwrap();
    let entries = offline.entries().await.unwrap();
    assert_eq!(entries.len(), 3);
    let f2 = entries.iter().find(|e| e.file_id == "f2").unwrap();
    assert_eq!(f2.reason, "network again");
    assert_eq!(f2.retry_count, 4);

    offline.remove("f2").await.unwrap();
    assert_eq!(offline.entries().await.unwrap().len(), 2);
}
