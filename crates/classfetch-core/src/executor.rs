//! External collaborators, as trait seams.
//!
//! The scheduler never does network or disk I/O itself: the executor owns
//! the actual byte transfer and must be idempotent per job payload, so
//! retrying the same payload cannot corrupt output. The identity provider
//! owns tokens; both are injected at scheduler construction.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Authentication failure, surfaced to the caller and never retried by the
/// scheduler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication required")]
    Required,
    #[error("authentication denied")]
    Denied,
}

/// Classified failure from one download attempt. The classification, not
/// the message, decides the scheduler's routing.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Transient connectivity failure; retried, then parked offline.
    #[error("network: {0}")]
    Network(String),
    /// Server-side throttle; converted into a backoff window and the job
    /// retried transparently.
    #[error("rate limited")]
    RateLimited {
        /// Raw `Retry-After` value, if the server sent one.
        retry_after: Option<String>,
    },
    /// Forbidden. Marked failed immediately, never retried.
    #[error("permission denied: {0}")]
    Permission(String),
    /// Gone from the remote. Marked failed immediately, never retried.
    #[error("not found: {0}")]
    NotFound(String),
    /// Token problems bubble up to the caller.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// The executor honored its cancellation token.
    #[error("download aborted")]
    Aborted,
    /// Anything else; treated as permanent.
    #[error("{0}")]
    Other(String),
}

impl DownloadError {
    /// Whether the scheduler may attempt this job again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Network(_) | DownloadError::RateLimited { .. })
    }
}

/// Result of a finished transfer.
#[derive(Debug, Clone, Copy)]
pub struct DownloadOutcome {
    pub bytes_written: u64,
}

/// Performs one download. `cancel` is set when the caller aborts; an
/// in-flight transfer is expected to notice and return
/// [`DownloadError::Aborted`] instead of completing.
#[async_trait]
pub trait DownloadExecutor: Send + Sync {
    async fn download(
        &self,
        payload: &serde_json::Value,
        destination_hint: &str,
        cancel: Arc<AtomicBool>,
    ) -> Result<DownloadOutcome, DownloadError>;
}

/// Supplies API tokens. `interactive` permits a user-facing prompt.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn token(&self, interactive: bool) -> Result<String, AuthError>;
}
