//! Runtime configuration: TOML file, then environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub healing: HealingConfig,
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Raw entries kept per fingerprint for healing context.
    pub recent_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recent_samples: crate::engine::fingerprint::RECENT_SAMPLE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// A result must be strictly above this to end the strategy chain.
    pub confidence_threshold: f64,
    pub strategy_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub retention_days: u32,
    /// How long a medium fingerprint must exist before the sweep heals it.
    pub medium_dwell_minutes: i64,
    /// When true, the escalation path also honours an existing reservation.
    pub escalation_respects_reservation: bool,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            strategy_timeout_secs: 60,
            sweep_interval_secs: 300,
            cleanup_interval_secs: 86_400,
            retention_days: 30,
            medium_dwell_minutes: 30,
            escalation_respects_reservation: false,
        }
    }
}

impl HealingConfig {
    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_secs(self.strategy_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn medium_dwell(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.medium_dwell_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            timeout_secs: 45,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file for the best-effort mirror. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,loghealer=debug".into(),
            json: false,
        }
    }
}

// =============================================================================
// Loading
// =============================================================================

impl Config {
    /// Load from `path` if it exists (defaults otherwise), then apply
    /// `LOGHEALER_*` environment overrides. A `.env` file is honoured.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_toml(&std::fs::read_to_string(path)?)?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, AppError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("LOGHEALER_LLM_API_KEY") {
            self.llm.api_key = Some(key);
            self.llm.enabled = true;
        }
        if let Some(url) = lookup("LOGHEALER_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = lookup("LOGHEALER_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(path) = lookup("LOGHEALER_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup("LOGHEALER_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let threshold = self.healing.confidence_threshold;
        if !(0.0..1.0).contains(&threshold) {
            return Err(AppError::Config(format!(
                "healing.confidence_threshold must be in [0, 1), got {}",
                threshold
            )));
        }
        if self.healing.strategy_timeout_secs == 0 {
            return Err(AppError::Config("healing.strategy_timeout_secs must be > 0".into()));
        }
        if self.llm.enabled && self.llm.base_url.trim().is_empty() {
            return Err(AppError::Config("llm.base_url is required when llm.enabled".into()));
        }
        Ok(())
    }
}
