//! Fingerprint engine: turns raw log entries into deduplicated fingerprints,
//! tracks frequency/severity/status, and emits update and trigger events.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use crate::error::AppError;

use super::bus::{BusEvent, EventBus, EventPayload};
use super::normalize;
use super::types::{Fingerprint, FingerprintStatus, LogEntry, Severity};

/// Default number of raw entries kept per fingerprint for healing context.
pub const RECENT_SAMPLE_LIMIT: usize = 10;

// =============================================================================
// Persistence seam
// =============================================================================

/// Durable mirror of the fingerprint table.
///
/// The engine is correct purely in memory; a store only receives copies and
/// its failures are logged, never propagated.
pub trait FingerprintStore: Send + Sync {
    fn upsert(&self, fingerprint: &Fingerprint) -> Result<(), AppError>;
    fn delete(&self, id: &str) -> Result<(), AppError>;
    fn load_all(&self) -> Result<Vec<Fingerprint>, AppError>;
}

// =============================================================================
// Engine
// =============================================================================

struct FingerprintRecord {
    fingerprint: Fingerprint,
    recent: VecDeque<LogEntry>,
}

impl FingerprintRecord {
    fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            recent: VecDeque::new(),
        }
    }

    fn remember(&mut self, entry: LogEntry, limit: usize) {
        if limit == 0 {
            return;
        }
        while self.recent.len() >= limit {
            self.recent.pop_front();
        }
        self.recent.push_back(entry);
    }
}

/// Result of ingesting one entry, mostly useful to callers that want to
/// report what happened without subscribing to the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub fingerprint: Fingerprint,
    pub created: bool,
    pub healing_triggered: bool,
}

pub struct FingerprintEngine {
    table: Mutex<HashMap<String, FingerprintRecord>>,
    bus: Arc<EventBus>,
    store: Option<Arc<dyn FingerprintStore>>,
    recent_limit: usize,
}

impl FingerprintEngine {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            bus,
            store: None,
            recent_limit: RECENT_SAMPLE_LIMIT,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn FingerprintStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_recent_limit(mut self, limit: usize) -> Self {
        self.recent_limit = limit;
        self
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, FingerprintRecord>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed the table from the store. Existing in-memory records win.
    pub fn restore_from_store(&self) -> Result<usize, AppError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };
        let stored = store.load_all()?;
        Ok(self.restore(stored))
    }

    /// Seed the table with previously persisted fingerprints.
    ///
    /// No attempt survives a restart, so `investigating` and `healing` come
    /// back as `new` and the corrected status is written back to the store.
    pub fn restore(&self, fingerprints: Vec<Fingerprint>) -> usize {
        let mut reset = Vec::new();
        let restored = {
            let mut table = self.table();
            let mut restored = 0;
            for mut fp in fingerprints {
                if table.contains_key(&fp.id) {
                    continue;
                }
                if matches!(
                    fp.status,
                    FingerprintStatus::Investigating | FingerprintStatus::Healing
                ) {
                    fp.status = FingerprintStatus::New;
                    reset.push(fp.clone());
                }
                table.insert(fp.id.clone(), FingerprintRecord::new(fp));
                restored += 1;
            }
            restored
        };
        for fp in &reset {
            tracing::debug!(fingerprint_id = %fp.id, "Interrupted healing reset to new");
            self.mirror(fp);
        }
        tracing::info!(restored, interrupted = reset.len(), "Restored fingerprints");
        restored
    }

    /// Ingest one log entry.
    ///
    /// Returns `None` when the entry is ignored (info/debug level or malformed).
    /// The frequency update, severity recompute and the `new -> investigating`
    /// transition happen under one lock, so two concurrent entries for the same
    /// fingerprint can never both observe `new` and both trigger healing.
    pub async fn process_log_entry(&self, entry: LogEntry) -> Option<IngestOutcome> {
        if !entry.level.is_actionable() {
            return None;
        }
        if entry.service.trim().is_empty() || entry.message.trim().is_empty() {
            tracing::debug!("Skipping malformed log entry without service or message");
            return None;
        }

        let pattern = normalize::normalize_message(&entry.message);
        let stack_signature = normalize::stack_signature(entry.stack_trace.as_deref());
        let id = normalize::fingerprint_id(&entry.service, &pattern, &stack_signature);
        let category = normalize::classify(&entry.message, entry.stack_trace.as_deref());

        let (updated, triggered, created) = {
            let mut table = self.table();
            let created = !table.contains_key(&id);
            let record = table.entry(id.clone()).or_insert_with(|| {
                FingerprintRecord::new(Fingerprint {
                    id: id.clone(),
                    pattern,
                    stack_signature,
                    service: entry.service.clone(),
                    category,
                    frequency: 0,
                    first_seen: entry.timestamp,
                    last_seen: entry.timestamp,
                    severity: Severity::Low,
                    status: FingerprintStatus::New,
                })
            });
            record.remember(entry.clone(), self.recent_limit);

            let fp = &mut record.fingerprint;
            fp.frequency += 1;
            if entry.timestamp > fp.last_seen {
                fp.last_seen = entry.timestamp;
            }
            if entry.timestamp < fp.first_seen {
                fp.first_seen = entry.timestamp;
            }
            fp.severity = fp.severity.max(Severity::from_frequency(fp.frequency));
            let updated = fp.clone();

            let triggered = if fp.severity != Severity::Low && fp.status == FingerprintStatus::New {
                fp.status = FingerprintStatus::Investigating;
                Some(fp.clone())
            } else {
                None
            };
            (updated, triggered, created)
        };

        if created {
            tracing::debug!(
                fingerprint_id = %id,
                service = %updated.service,
                category = %updated.category,
                "New fingerprint",
            );
        }
        self.mirror(triggered.as_ref().unwrap_or(&updated));

        self.bus
            .publish(BusEvent::new(
                &id,
                EventPayload::FingerprintUpdated {
                    fingerprint: updated.clone(),
                    entry,
                },
            ))
            .await;

        let healing_triggered = triggered.is_some();
        let latest = match triggered {
            Some(fp) => {
                let attempt_id = uuid::Uuid::new_v4().to_string();
                tracing::info!(
                    fingerprint_id = %id,
                    attempt_id = %attempt_id,
                    severity = %fp.severity,
                    frequency = fp.frequency,
                    "Fingerprint eligible for healing",
                );
                let event = BusEvent::new(
                    &id,
                    EventPayload::HealingTriggered {
                        attempt_id,
                        fingerprint: fp.clone(),
                    },
                )
                .with_metadata("category", fp.category.as_str())
                .with_metadata("severity", fp.severity.as_str());
                self.bus.publish(event).await;
                fp
            }
            None => updated,
        };

        Some(IngestOutcome {
            fingerprint: latest,
            created,
            healing_triggered,
        })
    }

    /// Set a fingerprint's status. No-op (returns `false`) for unknown ids.
    pub fn update_fingerprint_status(&self, id: &str, status: FingerprintStatus) -> bool {
        let snapshot = {
            let mut table = self.table();
            match table.get_mut(id) {
                Some(record) => {
                    if record.fingerprint.status == status {
                        return true;
                    }
                    record.fingerprint.status = status;
                    record.fingerprint.clone()
                }
                None => return false,
            }
        };
        tracing::debug!(fingerprint_id = %id, status = %status, "Fingerprint status updated");
        self.mirror(&snapshot);
        true
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<Fingerprint> {
        self.table().get(id).map(|r| r.fingerprint.clone())
    }

    /// All fingerprints, most frequent first.
    pub fn all(&self) -> Vec<Fingerprint> {
        self.collect(|_| true)
    }

    pub fn by_service(&self, service: &str) -> Vec<Fingerprint> {
        self.collect(|fp| fp.service == service)
    }

    pub fn by_severity(&self, severity: Severity) -> Vec<Fingerprint> {
        self.collect(|fp| fp.severity == severity)
    }

    pub fn by_status(&self, status: FingerprintStatus) -> Vec<Fingerprint> {
        self.collect(|fp| fp.status == status)
    }

    /// Most recent raw entries for a fingerprint, oldest first.
    pub fn recent_logs(&self, id: &str) -> Vec<LogEntry> {
        self.table()
            .get(id)
            .map(|r| r.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    fn collect(&self, keep: impl Fn(&Fingerprint) -> bool) -> Vec<Fingerprint> {
        let mut out: Vec<Fingerprint> = self
            .table()
            .values()
            .map(|r| &r.fingerprint)
            .filter(|fp| keep(fp))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.id.cmp(&b.id)));
        out
    }

    // -------------------------------------------------------------------------
    // Retention
    // -------------------------------------------------------------------------

    /// Remove resolved fingerprints last seen more than `older_than_days` ago.
    ///
    /// Fingerprints in any other status are kept regardless of age.
    pub fn cleanup(&self, older_than_days: u32) -> usize {
        self.cleanup_before(Utc::now() - Duration::days(i64::from(older_than_days)))
    }

    fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let removed: Vec<String> = {
            let mut table = self.table();
            let expired: Vec<String> = table
                .values()
                .filter(|r| {
                    r.fingerprint.status == FingerprintStatus::Resolved
                        && r.fingerprint.last_seen < cutoff
                })
                .map(|r| r.fingerprint.id.clone())
                .collect();
            for id in &expired {
                table.remove(id);
            }
            expired
        };

        if let Some(store) = self.store.as_ref() {
            for id in &removed {
                if let Err(e) = store.delete(id) {
                    tracing::warn!(fingerprint_id = %id, "Failed to delete mirrored fingerprint: {}", e);
                }
            }
        }
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "Cleaned up resolved fingerprints");
        }
        removed.len()
    }

    fn mirror(&self, fingerprint: &Fingerprint) {
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.upsert(fingerprint) {
                tracing::warn!(fingerprint_id = %fingerprint.id, "Fingerprint mirror failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::{ChannelHandler, EventType};
    use crate::engine::types::{ErrorCategory, LogLevel};

    fn engine_with_events() -> (
        FingerprintEngine,
        tokio::sync::mpsc::UnboundedReceiver<BusEvent>,
    ) {
        let bus = Arc::new(EventBus::new());
        let (handler, rx) = ChannelHandler::channel();
        bus.subscribe(EventType::FingerprintUpdated, handler.clone());
        bus.subscribe(EventType::HealingTriggered, handler);
        (FingerprintEngine::new(bus), rx)
    }

    fn error(service: &str, msg: &str) -> LogEntry {
        LogEntry::new(LogLevel::Error, service, msg)
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<BusEvent>) -> Vec<BusEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_ignores_info_and_debug() {
        let (engine, mut rx) = engine_with_events();
        assert!(engine
            .process_log_entry(LogEntry::new(LogLevel::Info, "svc", "hello"))
            .await
            .is_none());
        assert!(engine
            .process_log_entry(LogEntry::new(LogLevel::Debug, "svc", "hello"))
            .await
            .is_none());
        assert!(engine.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_skips_malformed_entries() {
        let (engine, _rx) = engine_with_events();
        assert!(engine.process_log_entry(error("", "boom")).await.is_none());
        assert!(engine.process_log_entry(error("svc", "   ")).await.is_none());
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_groups_messages_differing_by_numbers() {
        let (engine, _rx) = engine_with_events();
        let a = engine.process_log_entry(error("user-service", "User 123 not found")).await.unwrap();
        let b = engine.process_log_entry(error("user-service", "User 456 not found")).await.unwrap();
        assert_eq!(a.fingerprint.id, b.fingerprint.id);
        assert!(a.created);
        assert!(!b.created);
        assert_eq!(b.fingerprint.frequency, 2);
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test]
    async fn test_new_fingerprint_defaults() {
        let (engine, _rx) = engine_with_events();
        let out = engine.process_log_entry(error("api", "weird failure")).await.unwrap();
        let fp = out.fingerprint;
        assert_eq!(fp.frequency, 1);
        assert_eq!(fp.severity, Severity::Low);
        assert_eq!(fp.status, FingerprintStatus::New);
        assert_eq!(fp.category, ErrorCategory::Unknown);
        assert_eq!(fp.stack_signature, normalize::NO_STACK_SIGNATURE);
        assert_eq!(fp.first_seen, fp.last_seen);
    }

    #[tokio::test]
    async fn test_ten_database_errors_trigger_once() {
        let (engine, mut rx) = engine_with_events();
        for _ in 0..10 {
            engine
                .process_log_entry(error("user-service", "Database query failed for user 42"))
                .await;
        }
        let all = engine.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].frequency, 10);
        assert_eq!(all[0].severity, Severity::Medium);
        assert_eq!(all[0].category, ErrorCategory::Database);
        assert_eq!(all[0].status, FingerprintStatus::Investigating);

        let events = drain(&mut rx);
        let triggers = events
            .iter()
            .filter(|e| e.event_type() == EventType::HealingTriggered)
            .count();
        let updates = events
            .iter()
            .filter(|e| e.event_type() == EventType::FingerprintUpdated)
            .count();
        assert_eq!(triggers, 1);
        assert_eq!(updates, 10);

        // More occurrences while investigating never re-trigger
        for _ in 0..15 {
            engine
                .process_log_entry(error("user-service", "Database query failed for user 7"))
                .await;
        }
        let triggers = drain(&mut rx)
            .iter()
            .filter(|e| e.event_type() == EventType::HealingTriggered)
            .count();
        assert_eq!(triggers, 0);
    }

    #[tokio::test]
    async fn test_trigger_event_carries_metadata() {
        let (engine, mut rx) = engine_with_events();
        for _ in 0..10 {
            engine.process_log_entry(error("svc", "Request timed out")).await;
        }
        let trigger = drain(&mut rx)
            .into_iter()
            .find(|e| e.event_type() == EventType::HealingTriggered)
            .unwrap();
        assert_eq!(trigger.metadata["category"], "timeout");
        assert_eq!(trigger.metadata["severity"], "medium");
        match trigger.payload {
            EventPayload::HealingTriggered { attempt_id, fingerprint } => {
                assert!(!attempt_id.is_empty());
                assert_eq!(fingerprint.status, FingerprintStatus::Investigating);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_low_severity_never_triggers() {
        let (engine, mut rx) = engine_with_events();
        for _ in 0..9 {
            engine.process_log_entry(error("svc", "boom")).await;
        }
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .all(|e| e.event_type() != EventType::HealingTriggered));
        assert_eq!(engine.all()[0].severity, Severity::Low);
    }

    #[tokio::test]
    async fn test_failed_healing_becomes_eligible_again() {
        let (engine, mut rx) = engine_with_events();
        for _ in 0..10 {
            engine.process_log_entry(error("svc", "boom")).await;
        }
        let id = engine.all()[0].id.clone();
        drain(&mut rx);

        engine.update_fingerprint_status(&id, FingerprintStatus::New);
        let out = engine.process_log_entry(error("svc", "boom")).await.unwrap();
        assert!(out.healing_triggered);
        assert_eq!(out.fingerprint.status, FingerprintStatus::Investigating);
    }

    #[tokio::test]
    async fn test_update_status_unknown_is_noop() {
        let (engine, _rx) = engine_with_events();
        assert!(!engine.update_fingerprint_status("missing", FingerprintStatus::Resolved));
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_queries() {
        let (engine, _rx) = engine_with_events();
        for _ in 0..12 {
            engine.process_log_entry(error("a", "disk full")).await;
        }
        engine.process_log_entry(error("b", "disk full")).await;
        engine
            .process_log_entry(LogEntry::new(LogLevel::Warn, "b", "slow response"))
            .await;

        assert_eq!(engine.all().len(), 3);
        assert_eq!(engine.all()[0].frequency, 12);
        assert_eq!(engine.by_service("b").len(), 2);
        assert_eq!(engine.by_severity(Severity::Medium).len(), 1);
        assert_eq!(engine.by_severity(Severity::Low).len(), 2);
        assert_eq!(engine.by_status(FingerprintStatus::Investigating).len(), 1);
    }

    #[tokio::test]
    async fn test_recent_logs_bounded() {
        let bus = Arc::new(EventBus::new());
        let engine = FingerprintEngine::new(bus).with_recent_limit(3);
        for i in 0..5 {
            engine.process_log_entry(error("svc", &format!("boom {}", i))).await;
        }
        let id = engine.all()[0].id.clone();
        let recent = engine.recent_logs(&id);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "boom 2");
        assert_eq!(recent[2].message, "boom 4");
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_old_resolved() {
        let (engine, _rx) = engine_with_events();
        let old = Utc::now() - Duration::days(40);
        for (svc, status) in [
            ("resolved-old", Some(FingerprintStatus::Resolved)),
            ("new-old", None),
            ("investigating-old", Some(FingerprintStatus::Investigating)),
            ("healing-old", Some(FingerprintStatus::Healing)),
        ] {
            let out = engine
                .process_log_entry(error(svc, "boom").at(old))
                .await
                .unwrap();
            if let Some(status) = status {
                engine.update_fingerprint_status(&out.fingerprint.id, status);
            }
        }
        let fresh = engine.process_log_entry(error("resolved-fresh", "boom")).await.unwrap();
        engine.update_fingerprint_status(&fresh.fingerprint.id, FingerprintStatus::Resolved);

        assert_eq!(engine.cleanup(30), 1);
        assert_eq!(engine.len(), 4);
        assert!(engine.by_service("resolved-old").is_empty());
        assert_eq!(engine.by_service("resolved-fresh").len(), 1);
        assert_eq!(engine.by_service("new-old").len(), 1);
        assert_eq!(engine.by_service("healing-old").len(), 1);
    }

    #[tokio::test]
    async fn test_id_matches_pure_function() {
        let (engine, _rx) = engine_with_events();
        let out = engine.process_log_entry(error("svc", "User 9 not found")).await.unwrap();
        let expected = normalize::fingerprint_id(
            "svc",
            &normalize::normalize_message("User 1 not found"),
            normalize::NO_STACK_SIGNATURE,
        );
        assert_eq!(out.fingerprint.id, expected);
    }

    #[tokio::test]
    async fn test_restore_keeps_existing_records() {
        let (engine, _rx) = engine_with_events();
        let out = engine.process_log_entry(error("svc", "boom")).await.unwrap();
        let mut stale = out.fingerprint.clone();
        stale.frequency = 999;
        let mut other = out.fingerprint.clone();
        other.id = "other".into();
        assert_eq!(engine.restore(vec![stale, other]), 1);
        assert_eq!(engine.get(&out.fingerprint.id).unwrap().frequency, 1);
        assert!(engine.get("other").is_some());
    }

    #[tokio::test]
    async fn test_restore_resets_interrupted_statuses() {
        let (engine, _rx) = engine_with_events();
        let out = engine.process_log_entry(error("svc", "boom")).await.unwrap();
        let template = out.fingerprint;
        let restarted = FingerprintEngine::new(Arc::new(EventBus::new()));

        let records: Vec<Fingerprint> = [
            ("investigating", FingerprintStatus::Investigating),
            ("healing", FingerprintStatus::Healing),
            ("resolved", FingerprintStatus::Resolved),
        ]
        .into_iter()
        .map(|(id, status)| Fingerprint {
            id: id.into(),
            status,
            ..template.clone()
        })
        .collect();
        assert_eq!(restarted.restore(records), 3);

        assert_eq!(restarted.get("investigating").unwrap().status, FingerprintStatus::New);
        assert_eq!(restarted.get("healing").unwrap().status, FingerprintStatus::New);
        assert_eq!(restarted.get("resolved").unwrap().status, FingerprintStatus::Resolved);
    }

    struct RecordingStore {
        upserts: Mutex<Vec<Fingerprint>>,
    }

    impl FingerprintStore for RecordingStore {
        fn upsert(&self, fingerprint: &Fingerprint) -> Result<(), AppError> {
            self.upserts.lock().unwrap().push(fingerprint.clone());
            Ok(())
        }
        fn delete(&self, _id: &str) -> Result<(), AppError> {
            Err(AppError::Internal("read-only".into()))
        }
        fn load_all(&self) -> Result<Vec<Fingerprint>, AppError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_store_mirrors_updates_and_tolerates_failures() {
        let store = Arc::new(RecordingStore {
            upserts: Mutex::new(Vec::new()),
        });
        let engine = FingerprintEngine::new(Arc::new(EventBus::new())).with_store(store.clone());
        let out = engine
            .process_log_entry(error("svc", "boom").at(Utc::now() - Duration::days(90)))
            .await
            .unwrap();
        engine.update_fingerprint_status(&out.fingerprint.id, FingerprintStatus::Resolved);
        // delete fails but cleanup still removes from memory
        assert_eq!(engine.cleanup(30), 1);
        let upserts = store.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 2);
        assert_eq!(upserts[1].status, FingerprintStatus::Resolved);
    }
}
