//! Named mutual exclusion over the session store.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{keys, unix_millis, SessionStore, StoreError};

/// Pause between writing a lock record and reading it back.
const VERIFY_DELAY: Duration = Duration::from_millis(10);

/// Failure while acquiring a named lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// All acquisition attempts lost the race or found a live holder.
    #[error("lock timeout on {name}")]
    Timeout { name: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Proof of lock ownership, required to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub(crate) String);

/// Durable lock record under `<resource>_lock`. Exists only while held;
/// any party may seize it once its age exceeds the lock timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    token: String,
    version: u64,
    acquired_at_ms: i64,
}

/// Lock manager over a session store.
#[derive(Clone)]
pub struct StoreLock {
    store: SessionStore,
    /// Age after which a held lock is treated as abandoned.
    timeout: Duration,
    /// Linear backoff step between acquisition attempts.
    retry_step: Duration,
}

impl StoreLock {
    pub fn new(store: SessionStore, timeout: Duration, retry_step: Duration) -> Self {
        Self {
            store,
            timeout,
            retry_step,
        }
    }

    /// One acquisition attempt. Returns `None` when a live holder exists or
    /// a concurrent writer won the race.
    pub async fn try_acquire(&self, name: &str) -> Result<Option<LockToken>, StoreError> {
        let key = keys::lock(name);
        let now = unix_millis();

        let existing: Option<LockRecord> = self.store.get_json(&key).await?;
        let prior_version = match &existing {
            None => 0,
            Some(record) => {
                let age = now.saturating_sub(record.acquired_at_ms);
                if age <= self.timeout.as_millis() as i64 {
                    return Ok(None);
                }
                // Holder exceeded the timeout: treat it as crashed and seize.
                tracing::debug!(lock = name, age_ms = age, "seizing stale lock");
                record.version
            }
        };

        let token = Uuid::new_v4().to_string();
        let record = LockRecord {
            token: token.clone(),
            version: prior_version + 1,
            acquired_at_ms: now,
        };
        self.store.set_json(&key, &record).await?;

        // Read back to detect a lost race against a concurrent writer. The
        // short pause widens the window in which an overlapping write is
        // observed; only on confirmation is the lock considered held.
        tokio::time::sleep(VERIFY_DELAY).await;
        let confirmed: Option<LockRecord> = self.store.get_json(&key).await?;
        match confirmed {
            Some(stored) if stored.token == token => Ok(Some(LockToken(token))),
            _ => Ok(None),
        }
    }

    /// Acquire with linearly increasing backoff between attempts.
    /// Fails with `LockError::Timeout` after `max_retries` failed attempts.
    pub async fn acquire(&self, name: &str, max_retries: u32) -> Result<LockToken, LockError> {
        for attempt in 0..=max_retries {
            if let Some(token) = self.try_acquire(name).await? {
                return Ok(token);
            }
            if attempt < max_retries {
                let delay = self.retry_step.saturating_mul(attempt + 1);
                tokio::time::sleep(delay).await;
            }
        }
        Err(LockError::Timeout {
            name: name.to_string(),
        })
    }

    /// Refresh the record's age so a live holder is not seized mid-work.
    /// Returns false when the lock no longer carries our token (stolen or
    /// released); the caller should stop assuming ownership.
    pub async fn renew(&self, name: &str, token: &LockToken) -> Result<bool, StoreError> {
        let key = keys::lock(name);
        let Some(mut record) = self.store.get_json::<LockRecord>(&key).await? else {
            return Ok(false);
        };
        if record.token != token.0 {
            return Ok(false);
        }
        record.acquired_at_ms = unix_millis();
        self.store.set_json(&key, &record).await?;
        Ok(true)
    }

    /// Release the lock, but only if the stored record still carries our
    /// token. After a timeout steal the record belongs to someone else and
    /// must be left alone.
    pub async fn release(&self, name: &str, token: &LockToken) -> Result<(), StoreError> {
        let key = keys::lock(name);
        if let Some(record) = self.store.get_json::<LockRecord>(&key).await? {
            if record.token == token.0 {
                self.store.remove(&key).await?;
            } else {
                tracing::debug!(lock = name, "release skipped: lock was reacquired by another holder");
            }
        }
        Ok(())
    }

    pub(crate) fn store(&self) -> &SessionStore {
        &self.store
    }
}
