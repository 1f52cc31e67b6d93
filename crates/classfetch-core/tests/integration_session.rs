//! Integration test: on-disk session store, full enqueue-to-completion
//! pipeline, and crash recovery across two scheduler instances.
//!
//! Uses a file-writing executor so the test covers the real destination
//! path handling, and an identity provider the executor consults before
//! every write.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tempfile::tempdir;

use classfetch_core::config::ClassfetchConfig;
use classfetch_core::executor::{
    AuthError, DownloadError, DownloadExecutor, DownloadOutcome, IdentityProvider,
};
use classfetch_core::scheduler::{JobOutcome, RunOutcome, Scheduler};
use classfetch_core::store::SessionStore;

/// Provider that hands out one fixed token; denies interactive prompts.
struct StaticIdentity {
    token: String,
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn token(&self, interactive: bool) -> Result<String, AuthError> {
        if interactive {
            return Err(AuthError::Denied);
        }
        Ok(self.token.clone())
    }
}

/// Executor that authenticates, then writes the payload's `content` field
/// to the destination under a root directory.
struct FileWriter {
    root: PathBuf,
    identity: Arc<dyn IdentityProvider>,
}

#[async_trait]
impl DownloadExecutor for FileWriter {
    async fn download(
        &self,
        payload: &serde_json::Value,
        destination_hint: &str,
        _cancel: Arc<AtomicBool>,
    ) -> Result<DownloadOutcome, DownloadError> {
        let _token = self.identity.token(false).await?;

        let content = payload
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DownloadError::Other("payload missing content".into()))?;

        let dest = self.root.join(destination_hint);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DownloadError::Network(e.to_string()))?;
        }
        std::fs::write(&dest, content).map_err(|e| DownloadError::Network(e.to_string()))?;
        Ok(DownloadOutcome {
            bytes_written: content.len() as u64,
        })
    }
}

fn test_config() -> ClassfetchConfig {
    let mut cfg = ClassfetchConfig::default();
    cfg.scheduler.poll_interval_ms = 20;
    cfg.scheduler.retry_delay_ms = 20;
    cfg.limiter.max_tokens = 50.0;
    cfg.limiter.refill_rate = 50.0;
    cfg.lock.retry_step_ms = 10;
    cfg
}

fn file_writer(root: PathBuf) -> Arc<dyn DownloadExecutor> {
    Arc::new(FileWriter {
        root,
        identity: Arc::new(StaticIdentity {
            token: "session-token".into(),
        }),
    })
}

#[tokio::test]
async fn downloads_land_on_disk_and_state_persists() {
    let downloads = tempdir().unwrap();
    let state = tempdir().unwrap();
    let db_path = state.path().join("session.db");

    let store = SessionStore::open_at(&db_path).await.unwrap();
    let sched = Scheduler::new(
        store,
        test_config(),
        file_writer(downloads.path().to_path_buf()),
    );

    let mut tickets = Vec::new();
    for (file, dest, body) in [
        ("f1", "week1/syllabus.pdf", "syllabus body"),
        ("f2", "week1/slides.pdf", "slides body"),
        ("f3", "week2/notes.pdf", "notes body"),
    ] {
        let ticket = sched
            .enqueue(file, json!({"file": file, "content": body}), dest)
            .await
            .unwrap();
        tickets.push((ticket, dest, body));
    }

    let outcome = sched.start().await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished { processed: 3 });

    for (ticket, dest, body) in tickets {
        match ticket.wait().await.unwrap() {
            JobOutcome::Completed { bytes_written } => {
                assert_eq!(bytes_written, body.len() as u64)
            }
            other => panic!("expected completion for {dest}, got {other:?}"),
        }
        let written = std::fs::read_to_string(downloads.path().join(dest)).unwrap();
        assert_eq!(written, body);
    }

    // A reopened store sees the same finished queue.
    let reopened = SessionStore::open_at(&db_path).await.unwrap();
    let verifier = Scheduler::new(
        reopened,
        test_config(),
        file_writer(downloads.path().to_path_buf()),
    );
    let counts = verifier.queue_counts().await.unwrap();
    assert_eq!(counts.completed, 3);
    let progress = verifier.progress_snapshot().await.unwrap();
    assert_eq!(progress.completed, 3);
}

#[tokio::test]
async fn restarted_instance_finishes_an_interrupted_session() {
    let downloads = tempdir().unwrap();
    let state = tempdir().unwrap();
    let db_path = state.path().join("session.db");

    // First instance enqueues work but never runs it (process "crashed"
    // before the loop started).
    {
        let store = SessionStore::open_at(&db_path).await.unwrap();
        let sched = Scheduler::new(
            store,
            test_config(),
            file_writer(downloads.path().to_path_buf()),
        );
        sched
            .enqueue(
                "f1",
                json!({"file": "f1", "content": "survives restarts"}),
                "week1/readme.txt",
            )
            .await
            .unwrap();
    }

    // Second instance finds the pending job on startup and finishes it.
    let store = SessionStore::open_at(&db_path).await.unwrap();
    let sched = Scheduler::new(
        store,
        test_config(),
        file_writer(downloads.path().to_path_buf()),
    );

    let report = sched.heartbeat().await.unwrap();
    assert!(report.should_resume);

    let outcome = sched.start().await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished { processed: 1 });

    let jobs = sched.queue_counts().await.unwrap();
    assert_eq!(jobs.completed, 1);
    let written = std::fs::read_to_string(downloads.path().join("week1/readme.txt")).unwrap();
    assert_eq!(written, "survives restarts");
}

#[tokio::test]
async fn denied_identity_fails_the_job_permanently() {
    struct NoIdentity;

    #[async_trait]
    impl IdentityProvider for NoIdentity {
        async fn token(&self, _interactive: bool) -> Result<String, AuthError> {
            Err(AuthError::Required)
        }
    }

    let downloads = tempdir().unwrap();
    let store = SessionStore::open_memory().await.unwrap();
    let executor: Arc<dyn DownloadExecutor> = Arc::new(FileWriter {
        root: downloads.path().to_path_buf(),
        identity: Arc::new(NoIdentity),
    });
    let sched = Scheduler::new(store, test_config(), executor);

    let ticket = sched
        .enqueue(
            "f1",
            json!({"file": "f1", "content": "never written"}),
            "week1/locked.pdf",
        )
        .await
        .unwrap();
    sched.start().await.unwrap();

    match ticket.wait().await.unwrap() {
        JobOutcome::Failed { error, retryable } => {
            assert!(error.contains("authentication required"));
            assert!(!retryable);
        }
        other => panic!("expected auth failure, got {other:?}"),
    }

    assert_eq!(sched.queue_counts().await.unwrap().failed, 1);
    assert!(!downloads.path().join("week1/locked.pdf").exists());
}
