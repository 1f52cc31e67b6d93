//! Durable job queue and state machine.
//!
//! The whole queue is one JSON list under a single store key, mutated only
//! through the atomic updater so concurrent execution contexts never lose a
//! read-modify-write. Read-only snapshots skip the lock and may be stale.

mod offline;
mod ops;
mod types;

#[cfg(test)]
mod tests;

pub use offline::{OfflineEntry, OfflineQueue};
pub use ops::JobQueue;
pub use types::{Job, JobPatch, JobState, QueueCounts};
