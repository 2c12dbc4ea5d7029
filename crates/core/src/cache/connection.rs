//! Database connection management with pragma configuration.
//!
//! This module handles opening the SQLite database, applying required pragmas
//! for performance and concurrency (WAL mode), running migrations and
//! optionally capping the file size to emulate a client storage quota.

use super::migrations;
use crate::Error;
use std::path::Path;
use tokio_rusqlite::Connection;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;
     PRAGMA foreign_keys=ON;";

/// Cache database handle.
///
/// Wraps a tokio-rusqlite Connection that runs database operations
/// on a background thread. All statements are serialized on that thread,
/// which is what makes each `put` atomic with respect to concurrent `get`s.
#[derive(Clone, Debug)]
pub struct CacheDb {
    pub(crate) conn: Connection,
}

impl CacheDb {
    /// Open a database at the specified path.
    ///
    /// Creates the file if it doesn't exist, applies performance pragmas,
    /// and runs any pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path).await.map_err(|e| Error::Database(e.into()))?;
        Self::prepare(conn, None).await
    }

    /// Open a database whose total size may not exceed `quota_bytes`.
    ///
    /// Writes past the quota fail with [`Error::StoreFull`].
    pub async fn open_with_quota(path: impl AsRef<Path>, quota_bytes: u64) -> Result<Self, Error> {
        let conn = Connection::open(path).await.map_err(|e| Error::Database(e.into()))?;
        Self::prepare(conn, Some(quota_bytes)).await
    }

    /// Open an in-memory database for testing.
    ///
    /// Creates a temporary in-memory SQLite database with the same
    /// pragma configuration as file-based databases.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::Database(e.into()))?;
        Self::prepare(conn, None).await
    }

    /// In-memory database with a storage quota.
    pub async fn open_in_memory_with_quota(quota_bytes: u64) -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::Database(e.into()))?;
        Self::prepare(conn, Some(quota_bytes)).await
    }

    async fn prepare(conn: Connection, quota_bytes: Option<u64>) -> Result<Self, Error> {
        conn.call(|conn| {
            conn.execute_batch(PRAGMAS)?;
            Ok(())
        })
        .await
        .map_err(Error::Database)?;

        migrations::run(&conn).await?;

        if let Some(quota) = quota_bytes {
            apply_quota(&conn, quota).await?;
        }

        Ok(Self { conn })
    }
}

/// Cap the database at `quota_bytes` via `max_page_count`.
///
/// SQLite never lowers the limit below the current page count, so an
/// existing store larger than the quota simply stops growing.
async fn apply_quota(conn: &Connection, quota_bytes: u64) -> Result<(), Error> {
    let pages = conn
        .call(move |conn| -> Result<i64, tokio_rusqlite::rusqlite::Error> {
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            let max_pages = (quota_bytes as i64 / page_size.max(1)).max(1);
            let applied: i64 = conn.query_row(&format!("PRAGMA max_page_count = {max_pages}"), [], |row| row.get(0))?;
            Ok(applied)
        })
        .await
        .map_err(Error::Database)?;

    tracing::debug!(quota_bytes, pages, "applied storage quota");
    Ok(())
}
