pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;

use std::sync::Arc;

use serde::Serialize;

use config::Config;
use db::repos::healing as healing_repo;
use db::SqliteStore;
use engine::bus::{BusStats, EventBus};
use engine::fingerprint::FingerprintEngine;
use engine::orchestrator::{AttemptRecord, HealingOrchestrator};
use engine::provider::{CompletionClient, DisabledCompletionClient, HttpCompletionClient};
use engine::subscription::SchedulerStats;
use engine::types::HealingStats;
use error::AppError;

/// Attempts included in the run report.
const REPORT_RECENT_ATTEMPTS: u32 = 10;

/// The wired pipeline: one bus, one engine, one orchestrator.
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub engine: Arc<FingerprintEngine>,
    pub orchestrator: Arc<HealingOrchestrator>,
    pub store: Option<SqliteStore>,
}

/// Summary printed when the daemon exits.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub healing: HealingStats,
    pub scheduler: SchedulerStats,
    pub bus: BusStats,
    /// Over every attempt in the database, not only this run.
    pub success_rate: Option<f64>,
    pub recent_attempts: Vec<AttemptRecord>,
}

impl AppState {
    /// Collect in-memory stats plus the stored attempt history. Database
    /// errors are logged and leave the history fields empty.
    pub fn report(&self) -> RunReport {
        let (success_rate, recent_attempts) = match self.store.as_ref() {
            Some(store) => {
                let rate = healing_repo::success_rate(store.pool()).unwrap_or_else(|e| {
                    tracing::warn!("Could not read healing success rate: {}", e);
                    None
                });
                let recent = healing_repo::get_recent(store.pool(), REPORT_RECENT_ATTEMPTS)
                    .unwrap_or_else(|e| {
                        tracing::warn!("Could not read recent healing attempts: {}", e);
                        Vec::new()
                    });
                (rate, recent)
            }
            None => (None, Vec::new()),
        };
        RunReport {
            healing: self.orchestrator.healing_stats(),
            scheduler: self.orchestrator.scheduler_stats(),
            bus: self.bus.stats(),
            success_rate,
            recent_attempts,
        }
    }
}

/// Build the pipeline from config. Nothing is started; call
/// [`HealingOrchestrator::start`] once the runtime is up.
pub fn build(config: &Config) -> Result<AppState, AppError> {
    let bus = Arc::new(EventBus::new());

    let store = match config.database.path.as_deref() {
        Some(path) => Some(SqliteStore::new(db::init_db(path)?)),
        None => None,
    };

    let mut engine = FingerprintEngine::new(bus.clone()).with_recent_limit(config.engine.recent_samples);
    if let Some(store) = store.as_ref() {
        engine = engine.with_store(Arc::new(store.clone()));
    }
    let engine = Arc::new(engine);
    if let Err(e) = engine.restore_from_store() {
        tracing::warn!("Could not restore fingerprints from database: {}", e);
    }

    let client: Arc<dyn CompletionClient> = if config.llm.enabled {
        tracing::info!(model = %config.llm.model, base_url = %config.llm.base_url, "Generative fallback enabled");
        Arc::new(HttpCompletionClient::new(&config.llm)?)
    } else {
        tracing::info!("Generative fallback disabled");
        Arc::new(DisabledCompletionClient)
    };

    let mut orchestrator = HealingOrchestrator::new(engine.clone(), bus.clone(), config.healing.clone());
    if let Some(store) = store.as_ref() {
        orchestrator = orchestrator.with_store(Arc::new(store.clone()));
    }
    let orchestrator = Arc::new(orchestrator);
    orchestrator.register_default_strategies(client);
    orchestrator.attach();

    Ok(AppState {
        bus,
        engine,
        orchestrator,
        store,
    })
}
