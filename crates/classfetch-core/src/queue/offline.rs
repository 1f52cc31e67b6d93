//! Offline queue: jobs that exhausted transient-network retries.
//!
//! Bounded ring, oldest entry evicted first, deduplicated by file id. The
//! caller can replay entries once connectivity returns.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::lock::{atomic_update, StoreLock};
use crate::store::{keys, unix_millis, SessionStore};

/// One parked download, kept with enough context to re-enqueue it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineEntry {
    pub file_id: String,
    pub payload: serde_json::Value,
    pub destination_hint: String,
    /// Last recorded failure that sent the job here.
    pub reason: String,
    pub enqueued_at_ms: i64,
    pub retry_count: u32,
}

/// Bounded, deduplicated ring over the session store.
#[derive(Clone)]
pub struct OfflineQueue {
    store: SessionStore,
    lock: StoreLock,
    capacity: usize,
    lock_retries: u32,
}

impl OfflineQueue {
    pub fn new(store: SessionStore, lock: StoreLock, capacity: usize, lock_retries: u32) -> Self {
        Self {
            store,
            lock,
            capacity: capacity.max(1),
            lock_retries,
        }
    }

    /// Park a failed download. An entry with the same file id is replaced
    /// (latest failure wins); when full, the oldest entry is evicted.
    pub async fn push(
        &self,
        file_id: &str,
        payload: serde_json::Value,
        destination_hint: &str,
        reason: &str,
        retry_count: u32,
    ) -> Result<()> {
        let entry = OfflineEntry {
            file_id: file_id.to_string(),
            payload,
            destination_hint: destination_hint.to_string(),
            reason: reason.to_string(),
            enqueued_at_ms: unix_millis(),
            retry_count,
        };
        let capacity = self.capacity;
        atomic_update(
            &self.lock,
            keys::OFFLINE_QUEUE,
            self.lock_retries,
            move |mut entries: Vec<OfflineEntry>| {
                entries.retain(|e| e.file_id != entry.file_id);
                entries.push(entry);
                while entries.len() > capacity {
                    entries.remove(0);
                }
                Ok(entries)
            },
        )
        .await?;
        Ok(())
    }

    /// Unlocked snapshot of the parked entries, oldest first.
    pub async fn entries(&self) -> Result<Vec<OfflineEntry>> {
        Ok(self
            .store
            .get_json(keys::OFFLINE_QUEUE)
            .await?
            .unwrap_or_default())
    }

    /// Remove one entry by file id (after a successful replay).
    pub async fn remove(&self, file_id: &str) -> Result<()> {
        atomic_update(
            &self.lock,
            keys::OFFLINE_QUEUE,
            self.lock_retries,
            |mut entries: Vec<OfflineEntry>| {
                entries.retain(|e| e.file_id != file_id);
                Ok(entries)
            },
        )
        .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.remove(keys::OFFLINE_QUEUE).await?;
        Ok(())
    }
}
