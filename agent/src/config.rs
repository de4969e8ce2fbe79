//! Configuration management for the agent.

use hoard_engine::SyncConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// PostgreSQL connection URL of the remote store
    pub database_url: String,
    /// SQLite file holding the local cache
    pub cache_path: PathBuf,
    /// JSON schema file; the built-in demo schema when unset
    pub schema_path: Option<PathBuf>,
    /// Engine settings
    pub sync: SyncConfig,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?;
        let cache_path = lookup("HOARD_CACHE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("hoard.db"));
        let schema_path = lookup("HOARD_SCHEMA_PATH").map(PathBuf::from);

        let mut sync = SyncConfig::default();
        if let Some(v) = parsed(&lookup, "HOARD_MAX_SIZE_BYTES")? {
            sync.max_size_bytes = v;
        }
        if let Some(v) = parsed(&lookup, "HOARD_MAX_RECORDS")? {
            sync.max_records = v;
        }
        if let Some(v) = parsed::<u64>(&lookup, "HOARD_TTL_SECONDS")? {
            sync.ttl_seconds = (v > 0).then_some(v);
        }
        if let Some(v) = parsed(&lookup, "HOARD_SYNC_INTERVAL_SECONDS")? {
            sync.sync_interval_seconds = v;
        }
        if let Some(v) = parsed(&lookup, "HOARD_AUTO_SYNC")? {
            sync.enable_auto_sync = v;
        }
        if let Some(raw) = lookup("HOARD_RETRY_DELAYS") {
            sync.retry_delays = parse_delays(&raw)?;
        }
        if let Some(v) = parsed(&lookup, "HOARD_BATCH_SIZE")? {
            sync.batch_size = v;
        }
        if let Some(v) = parsed(&lookup, "HOARD_MAX_RETRIES")? {
            sync.max_retries = v;
        }

        Ok(Self {
            database_url,
            cache_path,
            schema_path,
            sync,
        })
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: raw.clone() })
        })
        .transpose()
}

/// Comma-separated seconds, e.g. `1,2,5,10`.
fn parse_delays(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64)
                .ok_or_else(|| ConfigError::Invalid {
                    key: "HOARD_RETRY_DELAYS",
                    value: raw.to_string(),
                })
        })
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid {key} value: {value:?}")]
    Invalid { key: &'static str, value: String },
}
