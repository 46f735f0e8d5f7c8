//! Opens the on-disk store. Mirrors the "single writer lane, concurrent readers" discipline
//! of §4.1/§5: one `SqlitePool` capped at a single connection owns every write, a second pool
//! serves concurrent reads, and `PRAGMA journal_mode=WAL` keeps readers from blocking on commit.

use crate::lock::ProcessLock;
use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone)]
pub struct StorePools {
    pub writer: SqlitePool,
    pub reader: SqlitePool,
    /// Released when the last clone of this `StorePools` drops, which for a single bridge
    /// process is process exit (or a clean `Store` teardown). `Arc`-wrapped so `StorePools`
    /// stays `Clone` without duplicating the lock's lifetime.
    _lock: Option<Arc<ProcessLock>>,
}

/// Opens the store exclusively: only one process may hold the sidecar lock file at a time.
/// This is what `bridge` itself calls — two bridge processes driving the same buffer would
/// race each other's claims and leases.
pub async fn open(db_path: &Path) -> anyhow::Result<StorePools> {
    let lock = ProcessLock::acquire(db_path).context("acquire buffer lock file")?;
    let mut pools = connect(db_path).await?;
    pools._lock = Some(Arc::new(lock));
    Ok(pools)
}

/// Opens the store without taking the sidecar lock, for tools that read and occasionally
/// mutate the buffer alongside an already-running bridge process — `buffer-monitor` (§6.3).
pub async fn open_shared(db_path: &Path) -> anyhow::Result<StorePools> {
    connect(db_path).await
}

async fn connect(db_path: &Path) -> anyhow::Result<StorePools> {
    let uri = format!("sqlite://{}", db_path.display());

    let options = SqliteConnectOptions::from_str(&uri)
        .with_context(|| format!("parse sqlite uri for {}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let writer = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options.clone())
        .await
        .with_context(|| format!("open writer pool at {}", db_path.display()))?;

    sqlx::migrate!("./migrations")
        .run(&writer)
        .await
        .context("run store migrations")?;

    let reader = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("open reader pool at {}", db_path.display()))?;

    Ok(StorePools { writer, reader, _lock: None })
}

/// Opens an in-memory store for tests. Public (not `#[cfg(test)]`) so downstream crates'
/// own test modules — `bridge-buffer`, `bridge-dispatcher` — can build a `Store` without a
/// throwaway file on disk.
pub async fn open_in_memory() -> anyhow::Result<StorePools> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.create_if_missing(true);

    let writer = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("open in-memory writer pool")?;

    sqlx::migrate!("./migrations")
        .run(&writer)
        .await
        .context("run store migrations")?;

    // A single in-memory SQLite connection cannot be shared across pool connections, so the
    // "reader" pool is just a clone of the writer in tests.
    let reader = writer.clone();

    Ok(StorePools { writer, reader, _lock: None })
}
