//! `SQLite`-backed directory shared by every process pointing at one file.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so the schema
//! bootstrap is safe to run from every process on every start.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use crate::{AppError, Result};

use super::store::{KvStore, StoreFuture};

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory backed by a `SQLite` database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the parent directory cannot be created and
    /// `AppError::StoreUnavailable` if the database cannot be opened.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    AppError::Io(format!("failed to create registry dir: {err}"))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        bootstrap_schema(&pool).await?;
        debug!(path = %path.display(), "sqlite registry opened");
        Ok(Self { pool })
    }

    /// Open a private in-memory database (single connection).
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` if the database cannot be opened.
    pub async fn connect_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        bootstrap_schema(&pool).await?;
        Ok(Self { pool })
    }
}

/// Apply the directory table definition.
///
/// # Errors
///
/// Returns `AppError::StoreUnavailable` if the DDL fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS kv (
    namespace   TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       BLOB NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}

impl KvStore for SqliteStore {
    fn put<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
        value: &'a [u8],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                "INSERT INTO kv (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value,
                 updated_at = excluded.updated_at",
            )
            .bind(namespace)
            .bind(key)
            .bind(value)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let row: Option<(Vec<u8>,)> =
                sqlx::query_as("SELECT value FROM kv WHERE namespace = ?1 AND key = ?2")
                    .bind(namespace)
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|(value,)| value))
        })
    }

    fn list<'a>(&'a self, namespace: &'a str, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            // substr comparison avoids LIKE wildcard escaping for `_` in prefixes.
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT key FROM kv
                 WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2
                 ORDER BY key ASC",
            )
            .bind(namespace)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(|(key,)| key).collect())
        })
    }

    fn delete<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM kv WHERE namespace = ?1 AND key = ?2")
                .bind(namespace)
                .bind(key)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }
}
