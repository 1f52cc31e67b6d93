//! Store error type.
//!
//! A failed write means "update did not happen": callers either retry or
//! surface the error, never assume the value landed.

use thiserror::Error;

/// Failure while reading or writing the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite/pool failure (I/O, quota, corruption).
    #[error("store backend: {0}")]
    Backend(#[from] sqlx::Error),
    /// A stored value could not be encoded or decoded as JSON.
    #[error("store value encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}
