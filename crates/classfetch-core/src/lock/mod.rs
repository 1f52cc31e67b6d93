//! Store-based advisory lock and the atomic state updater built on it.
//!
//! The lock is best-effort: the backing store has no compare-and-swap, so
//! acquisition writes a random token and reads it back to detect a lost
//! race. That leaves a small window under adversarial timing; keep the
//! timeout in single-digit seconds so a crashed holder is seized quickly
//! and the staleness window stays bounded.

mod atomic;
mod store_lock;


pub use atomic::atomic_update;
pub use store_lock::{LockError, LockToken, StoreLock};
