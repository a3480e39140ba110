//! Optional SQLite mirror of fingerprints and healing attempts.
//!
//! The pipeline is correct purely in memory; this module only receives copies
//! so reports survive restarts and the engine can be re-seeded on startup.

pub mod migrations;
pub mod repos;

use std::path::Path;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;

use crate::engine::fingerprint::FingerprintStore;
use crate::engine::orchestrator::{AttemptRecord, HealingStore};
use crate::engine::types::Fingerprint;
use crate::error::AppError;

use self::repos::{fingerprints as fingerprint_repo, healing as healing_repo};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection customizer that sets per-connection SQLite pragmas.
#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -8000;",
        )?;
        Ok(())
    }
}

/// Open (or create) the database file, enable WAL and run migrations.
pub fn init_db(db_path: &Path) -> Result<DbPool, AppError> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path.display(), "Initializing database");

    let manager = SqliteConnectionManager::file(db_path);
    let pool = Pool::builder()
        .max_size(4)
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)?;

    // Database-wide, only needs to run once
    {
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        tracing::debug!("SQLite pragmas configured (WAL, busy_timeout)");
    }

    {
        let conn = pool.get()?;
        migrations::run(&conn)?;
    }

    tracing::info!("Database initialized successfully");
    Ok(pool)
}

#[cfg(test)]
pub fn init_test_db() -> Result<DbPool, AppError> {
    use std::time::Duration;

    // Unique temp file per test; in-memory databases are per-connection under r2d2.
    let tmp = std::env::temp_dir().join(format!("loghealer_test_{}.db", uuid::Uuid::new_v4()));
    let manager = SqliteConnectionManager::file(&tmp);
    let pool = Pool::builder()
        .max_size(2)
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)?;

    let conn = pool.get()?;
    migrations::run(&conn)?;
    drop(conn);
    Ok(pool)
}

// =============================================================================
// Store adapters
// =============================================================================

/// Pool-backed implementation of the engine and orchestrator persistence seams.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl FingerprintStore for SqliteStore {
    fn upsert(&self, fingerprint: &Fingerprint) -> Result<(), AppError> {
        fingerprint_repo::upsert(&self.pool, fingerprint)
    }

    fn delete(&self, id: &str) -> Result<(), AppError> {
        fingerprint_repo::delete(&self.pool, id).map(|_| ())
    }

    fn load_all(&self) -> Result<Vec<Fingerprint>, AppError> {
        fingerprint_repo::get_all(&self.pool)
    }
}

impl HealingStore for SqliteStore {
    fn record_attempt(&self, record: &AttemptRecord) -> Result<(), AppError> {
        healing_repo::insert(&self.pool, record)
    }
}
