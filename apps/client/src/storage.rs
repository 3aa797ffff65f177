//! Device-local persistence: a small key/value store (session mirror, theme)
//! and time-stamped cache entries that are swept on startup.

use std::path::PathBuf;

use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::error::AppResult;

pub async fn open_pool(db_path: PathBuf) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

#[derive(Debug, sqlx::FromRow)]
struct ValueRow {
    value: String,
}

#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub async fn new(pool: SqlitePool) -> AppResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open(db_path: PathBuf) -> AppResult<Self> {
        Self::new(open_pool(db_path).await?).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                stored_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_entries_stored_at ON cache_entries(stored_at ASC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let row = sqlx::query_as::<_, ValueRow>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.value))
    }

    pub async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reads a JSON value. An unreadable value is dropped and reported absent.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!(component = "storage", key = key, error = %err, "discarding unreadable value");
                self.remove(key).await?;
                Ok(None)
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> AppResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw).await
    }

    pub async fn cache_put(&self, key: &str, value: &str) -> AppResult<()> {
        self.cache_put_at(key, value, Utc::now().timestamp()).await
    }

    async fn cache_put_at(&self, key: &str, value: &str, stored_at: i64) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, stored_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(stored_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cache_get(&self, key: &str) -> AppResult<Option<String>> {
        let row = sqlx::query_as::<_, ValueRow>("SELECT value FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.value))
    }

    /// Deletes cache entries stored more than `ttl` ago. Returns how many.
    pub async fn sweep_cache(&self, ttl: Duration) -> AppResult<u64> {
        let cutoff = (Utc::now() - ttl).timestamp();
        let result = sqlx::query("DELETE FROM cache_entries WHERE stored_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!(component = "storage", removed, "swept stale cache entries");
        }
        Ok(removed)
    }
}
