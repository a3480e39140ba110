use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::db::DbPool;
use crate::engine::types::{ErrorCategory, Fingerprint, FingerprintStatus, Severity};
use crate::error::AppError;

pub(crate) fn parse_ts(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_fingerprint(row: &Row) -> rusqlite::Result<Fingerprint> {
    let category: String = row.get("category")?;
    let severity: String = row.get("severity")?;
    let status: String = row.get("status")?;
    let first_seen: String = row.get("first_seen")?;
    let last_seen: String = row.get("last_seen")?;
    Ok(Fingerprint {
        id: row.get("id")?,
        pattern: row.get("pattern")?,
        stack_signature: row.get("stack_signature")?,
        service: row.get("service")?,
        category: ErrorCategory::parse(&category),
        frequency: row.get::<_, i64>("frequency")?.max(0) as u64,
        first_seen: parse_ts(6, &first_seen)?,
        last_seen: parse_ts(7, &last_seen)?,
        severity: Severity::parse(&severity).unwrap_or(Severity::Low),
        status: FingerprintStatus::parse(&status).unwrap_or(FingerprintStatus::New),
    })
}

pub fn upsert(pool: &DbPool, fp: &Fingerprint) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO fingerprints
         (id, pattern, stack_signature, service, category, frequency, first_seen, last_seen, severity, status, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
            frequency = excluded.frequency,
            first_seen = excluded.first_seen,
            last_seen = excluded.last_seen,
            severity = excluded.severity,
            status = excluded.status,
            updated_at = excluded.updated_at",
        params![
            fp.id,
            fp.pattern,
            fp.stack_signature,
            fp.service,
            fp.category.as_str(),
            fp.frequency as i64,
            fp.first_seen.to_rfc3339(),
            fp.last_seen.to_rfc3339(),
            fp.severity.as_str(),
            fp.status.as_str(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn delete(pool: &DbPool, id: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute("DELETE FROM fingerprints WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

pub fn get_all(pool: &DbPool) -> Result<Vec<Fingerprint>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM fingerprints ORDER BY frequency DESC, id")?;
    let rows = stmt.query_map([], row_to_fingerprint)?;
    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(fp) => out.push(fp),
            Err(e) => tracing::warn!("Skipping unreadable fingerprint row: {}", e),
        }
    }
    Ok(out)
}
