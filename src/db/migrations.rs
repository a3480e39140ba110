use rusqlite::Connection;

use crate::error::AppError;

/// Create the mirror schema. Idempotent.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Fingerprints
-- ============================================================================

CREATE TABLE IF NOT EXISTS fingerprints (
    id               TEXT PRIMARY KEY,
    pattern          TEXT NOT NULL,
    stack_signature  TEXT NOT NULL,
    service          TEXT NOT NULL,
    category         TEXT NOT NULL,
    frequency        INTEGER NOT NULL DEFAULT 0,
    first_seen       TEXT NOT NULL,
    last_seen        TEXT NOT NULL,
    severity         TEXT NOT NULL DEFAULT 'low',
    status           TEXT NOT NULL DEFAULT 'new',
    updated_at       TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_fingerprints_service  ON fingerprints(service);
CREATE INDEX IF NOT EXISTS idx_fingerprints_status   ON fingerprints(status);
CREATE INDEX IF NOT EXISTS idx_fingerprints_severity ON fingerprints(severity);

-- ============================================================================
-- Healing attempts (kept after their fingerprint is cleaned up)
-- ============================================================================

CREATE TABLE IF NOT EXISTS healing_attempts (
    id                    TEXT PRIMARY KEY,
    fingerprint_id        TEXT NOT NULL,
    origin                TEXT NOT NULL,
    strategy              TEXT,
    success               INTEGER NOT NULL DEFAULT 0,
    confidence            REAL NOT NULL DEFAULT 0,
    reasoning             TEXT NOT NULL DEFAULT '',
    actions               TEXT NOT NULL DEFAULT '[]',
    strategies_attempted  INTEGER NOT NULL DEFAULT 0,
    elapsed_ms            INTEGER NOT NULL DEFAULT 0,
    created_at            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_healing_attempts_fp      ON healing_attempts(fingerprint_id);
CREATE INDEX IF NOT EXISTS idx_healing_attempts_created ON healing_attempts(created_at);
"#;
