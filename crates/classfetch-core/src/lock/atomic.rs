//! Linearizable read-modify-write over one named store value.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::store_lock::StoreLock;

/// Atomically update the value stored under `key`.
///
/// Acquires the lock named after the key (with linear backoff up to
/// `max_retries` attempts, failing with a downcastable
/// [`LockError::Timeout`](super::LockError) when exhausted), reads the
/// current value (absent becomes `T::default()`), applies `f`, writes the
/// result, and releases the lock on every exit path, including an error
/// from `f`. Returns the value that was written.
pub async fn atomic_update<T, F>(lock: &StoreLock, key: &str, max_retries: u32, f: F) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(T) -> Result<T>,
{
    let token = lock.acquire(key, max_retries).await?;

    let body = async {
        let current: T = lock.store().get_json(key).await?.unwrap_or_default();
        let updated = f(current)?;
        lock.store().set_json(key, &updated).await?;
        Ok(updated)
    }
    .await;

    // The lock is released whether the body succeeded or not.
    lock.release(key, &token).await?;

    body
}
