use rusqlite::{params, Row};

use crate::db::repos::fingerprints::parse_ts;
use crate::db::DbPool;
use crate::engine::orchestrator::{AttemptOrigin, AttemptRecord};
use crate::error::AppError;

fn row_to_attempt(row: &Row) -> rusqlite::Result<AttemptRecord> {
    let origin: String = row.get("origin")?;
    let actions: String = row.get("actions")?;
    let created_at: String = row.get("created_at")?;
    Ok(AttemptRecord {
        attempt_id: row.get("id")?,
        fingerprint_id: row.get("fingerprint_id")?,
        origin: AttemptOrigin::parse(&origin).unwrap_or(AttemptOrigin::Trigger),
        strategy: row.get("strategy")?,
        success: row.get::<_, i32>("success")? != 0,
        confidence: row.get("confidence")?,
        reasoning: row.get("reasoning")?,
        actions: serde_json::from_str(&actions).unwrap_or_default(),
        strategies_attempted: row.get::<_, i64>("strategies_attempted")?.max(0) as usize,
        elapsed_ms: row.get::<_, i64>("elapsed_ms")?.max(0) as u64,
        created_at: parse_ts(10, &created_at)?,
    })
}

pub fn insert(pool: &DbPool, record: &AttemptRecord) -> Result<(), AppError> {
    let actions = serde_json::to_string(&record.actions)?;
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO healing_attempts
         (id, fingerprint_id, origin, strategy, success, confidence, reasoning, actions, strategies_attempted, elapsed_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.attempt_id,
            record.fingerprint_id,
            record.origin.as_str(),
            record.strategy,
            record.success as i32,
            record.confidence,
            record.reasoning,
            actions,
            record.strategies_attempted as i64,
            record.elapsed_ms as i64,
            record.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_recent(pool: &DbPool, limit: u32) -> Result<Vec<AttemptRecord>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM healing_attempts ORDER BY created_at DESC LIMIT ?1")?;
    let rows = stmt.query_map(params![limit], row_to_attempt)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Success rate over the stored attempts, `None` when there are none.
pub fn success_rate(pool: &DbPool) -> Result<Option<f64>, AppError> {
    let conn = pool.get()?;
    let (total, succeeded): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM healing_attempts",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if total == 0 {
        return Ok(None);
    }
    Ok(Some(succeeded as f64 / total as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::engine::types::{ActionKind, RemediationAction};
    use chrono::{Duration, Utc};

    fn make_record(id: &str, fingerprint_id: &str, success: bool, age_secs: i64) -> AttemptRecord {
        AttemptRecord {
            attempt_id: id.into(),
            fingerprint_id: fingerprint_id.into(),
            origin: AttemptOrigin::Escalation,
            strategy: success.then(|| "service_restart".to_string()),
            success,
            confidence: if success { 0.85 } else { 0.0 },
            reasoning: "test".into(),
            actions: vec![RemediationAction::proposed(ActionKind::Restart, "svc", "restart")],
            strategies_attempted: 2,
            elapsed_ms: 15,
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_insert_and_read_back_newest_first() {
        let pool = init_test_db().unwrap();
        insert(&pool, &make_record("a1", "fp-1", true, 10)).unwrap();
        insert(&pool, &make_record("a2", "fp-1", false, 0)).unwrap();
        insert(&pool, &make_record("a3", "fp-2", true, 5)).unwrap();

        let attempts = get_recent(&pool, 10).unwrap();
        let ids: Vec<&str> = attempts.iter().map(|a| a.attempt_id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a3", "a1"]);
        let oldest = &attempts[2];
        assert_eq!(oldest.fingerprint_id, "fp-1");
        assert_eq!(oldest.origin, AttemptOrigin::Escalation);
        assert_eq!(oldest.actions[0].kind, ActionKind::Restart);
        assert_eq!(oldest.strategy.as_deref(), Some("service_restart"));
    }

    #[test]
    fn test_recent_and_success_rate() {
        let pool = init_test_db().unwrap();
        assert_eq!(success_rate(&pool).unwrap(), None);
        insert(&pool, &make_record("a1", "fp-1", true, 10)).unwrap();
        insert(&pool, &make_record("a2", "fp-1", false, 0)).unwrap();

        let recent = get_recent(&pool, 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].attempt_id, "a2");
        assert_eq!(success_rate(&pool).unwrap(), Some(0.5));
    }
}
