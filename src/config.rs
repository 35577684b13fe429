use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub store: StoreConfig,
    pub quota: QuotaConfig,
    pub reaper: ReaperConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub database_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaConfig {
    /// Seconds between bandwidth-usage resets for each user
    pub reset_period_secs: i64,
    /// How many times the engine retries a conflicted atomic update
    pub max_conflict_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReaperConfig {
    pub sweep_interval_secs: u64,
    /// Sessions idle longer than this are reclaimed by the reaper
    pub inactivity_threshold_secs: i64,
    /// Hard TTL: sessions older than this past last_active are purged
    /// outright as a backstop, release already having been attempted
    pub session_ttl_secs: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::TurnError::Config(e.to_string()))?;

        toml::from_str(&content)
            .map_err(|e| crate::error::TurnError::Config(e.to_string()))
    }

    pub fn default() -> Self {
        Self {
            store: StoreConfig {
                database_url: "sqlite://turn.db?mode=rwc".to_string(),
            },
            quota: QuotaConfig {
                reset_period_secs: 24 * 60 * 60, // 24 hours
                max_conflict_retries: 3,
            },
            reaper: ReaperConfig {
                sweep_interval_secs: 300,
                inactivity_threshold_secs: 3600, // 1 hour
                session_ttl_secs: 7200,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}
