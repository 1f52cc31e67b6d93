//! Session-scoped persistent key-value store (SQLite via sqlx).
//!
//! The store is the single source of truth for every durable entity: the
//! job queue, rate-limiter buckets, progress snapshot, abort flag, offline
//! queue, and lock records. In-memory state is always a reconstructable
//! projection of what lives here.

mod db;
mod error;
pub mod keys;

pub use db::SessionStore;
pub use error::StoreError;

pub(crate) use db::unix_millis;
