//! SQLite-backed store implementation.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::StoreError;

/// Percent-encode a path for use in a sqlite:// URI so spaces and special chars don't break parsing.
fn path_to_sqlite_uri(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '&' => out.push_str("%26"),
            c => out.push(c),
        }
    }
    format!("sqlite://{}", out)
}

/// Handle to the session store.
///
/// The database file lives under the XDG state directory:
/// `~/.local/state/classfetch/session.db`.
#[derive(Clone)]
pub struct SessionStore {
    pool: Pool<Sqlite>,
}

impl SessionStore {
    /// Open (or create) the default session store and run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("classfetch")?;
        let state_dir = xdg_dirs.get_state_home().join("classfetch");
        let db_path = state_dir.join("session.db");

        tokio::fs::create_dir_all(&state_dir).await?;

        let uri = path_to_sqlite_uri(&db_path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new().max_connections(8).connect(&uri).await?;

        let store = SessionStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open (or create) the store at a specific path. Creates parent dirs if
    /// needed. Intended for tests so the DB can live in a temp directory.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let uri = path_to_sqlite_uri(path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new().max_connections(8).connect(&uri).await?;
        let store = SessionStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory store (no disk I/O). A single connection keeps all
    /// clones of the handle on the same database.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = SessionStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Close the connection pool. Every later operation fails with a
    /// store error; intended for graceful shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch the raw value stored under `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(r#"SELECT value FROM kv WHERE key = ?1"#)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// Store `value` under `key`, replacing any previous value.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(unix_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove the value stored under `key`. Removing an absent key is fine.
    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query(r#"DELETE FROM kv WHERE key = ?1"#)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Decode the JSON value stored under `key`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Encode `value` as JSON and store it under `key`.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw).await
    }

    /// Session-end wipe: drop every key.
    pub async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query(r#"DELETE FROM kv"#).execute(&self.pool).await?;
        Ok(())
    }
}

/// Current time as Unix milliseconds. All durable timestamps use this.
pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
