//! The embedded relational store: one `SqlitePool` plus typed operations
//! over every static table, the two FTS5 shadow tables, and the
//! block-layover / import-metadata / problem-report side tables.
//!
//! Connection-pool policy follows a `SqlitePool::connect` + `sqlx::migrate!`
//! startup sequence, with pragma tuning and a pool-size split between
//! in-memory and file-backed stores (in-memory SQLite databases are
//! per-connection, so a pool bigger than one would silently fragment the
//! data across independent empty databases).

pub mod bulk;
pub mod queries;
mod schema;

pub use bulk::DEFAULT_BATCH_SIZE;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::config::DataPath;
use crate::error::StoreError;

/// Bounded pool size used for file-backed stores. In-memory stores are
/// always opened with exactly one connection.
const FILE_POOL_SIZE: u32 = 25;
const FILE_POOL_IDLE_LIFETIME: Duration = Duration::from_secs(30 * 60);
/// ~64 MiB page cache (negative value = KiB per SQLite convention).
const CACHE_SIZE_KIB: i64 = -64_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    File,
}

/// Embedded SQL store over one `SqlitePool`.
pub struct Store {
    pool: SqlitePool,
    kind: StoreKind,
    /// Path to the backing file, if any; used by the Manager to delete the
    /// file once the store is retired.
    path: Option<String>,
}

impl Store {
    /// Open (creating if absent) a store at `data_path` and run pending
    /// migrations. `Environment::Test` + a file path is the caller's
    /// responsibility to reject before calling this (see
    /// [`crate::config::Config::validate`]); this constructor only handles
    /// the mechanics of opening the pool.
    pub async fn open(data_path: &DataPath) -> Result<Self, StoreError> {
        match data_path {
            DataPath::Memory => Self::open_memory().await,
            DataPath::File(path) => Self::open_file(path).await,
        }
    }

    pub async fn open_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", "MEMORY")
            .pragma("cache_size", CACHE_SIZE_KIB.to_string());

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        Self::finish_open(pool, StoreKind::Memory, None).await
    }

    pub async fn open_file(path: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{path}?mode=rwc"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", "MEMORY")
            .pragma("cache_size", CACHE_SIZE_KIB.to_string());

        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .max_lifetime(FILE_POOL_IDLE_LIFETIME)
            .connect_with(opts)
            .await?;

        Self::finish_open(pool, StoreKind::File, Some(path.to_string())).await
    }

    async fn finish_open(
        pool: SqlitePool,
        kind: StoreKind,
        path: Option<String>,
    ) -> Result<Self, StoreError> {
        schema::MIGRATOR.run(&pool).await?;
        info!(?kind, path = ?path, "store opened");
        Ok(Self { pool, kind, path })
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Close the pool. Callers that opened a file-backed store are
    /// responsible for removing the backing file afterward (the Manager's
    /// hot-swap protocol does this once no reader can still observe it).
    pub async fn close(&self) {
        debug!(path = ?self.path, "closing store");
        self.pool.close().await;
    }
}
