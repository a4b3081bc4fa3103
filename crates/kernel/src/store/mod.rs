//! Persistence store — durable SQLite storage for every entity the
//! control plane owns.
//!
//! One `Store` struct, constructor, and error taxonomy live here; entity
//! operations are added by sibling modules (`project`, `service`, `route`,
//! `cert`, `token`, `audit`, `search`) in `impl Store` blocks.
//!
//! Mutations that must be atomic with cascades or search-index updates
//! take a caller-provided [`sqlx::Transaction`]; single-row mutations have
//! pool convenience wrappers.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

mod migrate;
pub mod project;
pub mod service;
pub mod route;
pub mod cert;
pub mod token;
pub mod audit;
pub mod search;

pub use audit::AuditEntry;
pub use cert::{CertType, Certificate};
pub use project::Project;
pub use route::{Route, RouteBinding, RouteSpec};
pub use search::{Document, SearchHit};
pub use service::{DesiredState, HealthStatus, PortMap, Service, ServiceSpec, VolumeMap};
pub use token::Token;

pub type Tx<'t> = sqlx::Transaction<'t, sqlx::Sqlite>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    UniqueConflict(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("transient database error: {0}")]
    Transient(String),
    #[error("database error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Classify an sqlx error. `what` names the entity for not-found and
    /// conflict messages.
    pub(crate) fn classify(err: sqlx::Error, what: &str) -> StoreError {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound(what.to_string()),
            sqlx::Error::Database(db) => {
                let code = db.code().unwrap_or_default().to_string();
                match code.as_str() {
                    // SQLITE_CONSTRAINT_UNIQUE / _PRIMARYKEY
                    "2067" | "1555" => StoreError::UniqueConflict(what.to_string()),
                    // SQLITE_CONSTRAINT_FOREIGNKEY / _CHECK / _NOTNULL
                    "787" | "275" | "1299" => {
                        StoreError::ConstraintViolation(db.message().to_string())
                    }
                    // SQLITE_BUSY / SQLITE_LOCKED
                    "5" | "6" => StoreError::Transient(db.message().to_string()),
                    _ => StoreError::Fatal(db.message().to_string()),
                }
            }
            sqlx::Error::PoolTimedOut => StoreError::Transient("connection pool timed out".into()),
            _ => StoreError::Fatal(err.to_string()),
        }
    }
}

pub struct Store {
    pool: SqlitePool,
    /// Long scans go through a second handle so they never starve writers.
    read_pool: SqlitePool,
    fts_enabled: AtomicBool,
}

impl Store {
    /// Open (creating if missing) the database file, run migrations, and
    /// probe full-text capability.
    pub async fn open(path: &Path) -> Result<Store, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options.clone())
            .await
            .map_err(|e| StoreError::Fatal(format!("open database: {e}")))?;

        let read_pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options.read_only(true))
            .await
            .map_err(|e| StoreError::Fatal(format!("open read-only handle: {e}")))?;

        let store = Store {
            pool,
            read_pool,
            fts_enabled: AtomicBool::new(false),
        };
        store.initialize().await?;
        Ok(store)
    }

    /// In-memory store for tests. Single connection so the database
    /// outlives individual acquires.
    pub async fn open_memory() -> Result<Store, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Fatal(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Fatal(e.to_string()))?;

        let store = Store {
            read_pool: pool.clone(),
            pool,
            fts_enabled: AtomicBool::new(false),
        };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        migrate::run(&self.pool).await?;

        // FTS5 is a compile-time sqlite option; probe instead of assuming.
        let fts = migrate::try_enable_fts(&self.pool).await;
        self.fts_enabled.store(fts, Ordering::Relaxed);
        if !fts {
            tracing::warn!("sqlite FTS5 unavailable; search degrades to prefix matching");
        }
        Ok(())
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled.load(Ordering::Relaxed)
    }

    pub async fn begin(&self) -> Result<Tx<'static>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::classify(e, "transaction"))
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn read_pool(&self) -> &SqlitePool {
        &self.read_pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        self.read_pool.close().await;
    }
}
