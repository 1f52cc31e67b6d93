//! Namespaced key layout for durable values.
//!
//! Each entity lives under a distinct key; there is no cross-key
//! transaction, so anything that must change together lives in one value.

/// Main job queue (JSON list of `Job`).
pub const QUEUE: &str = "cf.queue";

/// Offline queue (JSON list of `OfflineEntry`).
pub const OFFLINE_QUEUE: &str = "cf.offline_queue";

/// Derived progress snapshot (allowed to be stale).
pub const PROGRESS: &str = "cf.progress";

/// Marker for the operation currently driving the scheduler.
pub const CURRENT_OPERATION: &str = "cf.current_operation";

/// Global abort flag ("1" when set). Persisted so abort survives restart.
pub const ABORT_FLAG: &str = "cf.abort";

/// Lock name serializing scheduler loops across process instances.
pub const SCHEDULER_OWNER: &str = "cf.scheduler_owner";

/// Rate-limiter bucket state for one identity.
pub fn bucket(identity: &str) -> String {
    format!("cf.bucket.{identity}")
}

/// Lock record key for a named resource.
pub fn lock(resource: &str) -> String {
    format!("{resource}_lock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_keys() {
        assert_eq!(bucket("default"), "cf.bucket.default");
        assert_eq!(lock("cf.queue"), "cf.queue_lock");
    }
}
