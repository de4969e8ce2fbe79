//! Engine configuration.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cache budgets, retry policy and sync cadence.
///
/// Durations are expressed in seconds when (de)serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Total payload bytes the cache may hold across all tables
    pub max_size_bytes: u64,
    /// Records each table may hold
    pub max_records: u64,
    /// Default record lifetime; `None` disables expiry
    pub ttl_seconds: Option<u64>,
    /// Period of the automatic sync cycle
    pub sync_interval_seconds: u64,
    /// Whether the auto-sync loop runs cycles on its own timer
    pub enable_auto_sync: bool,
    /// Backoff table indexed by attempt count
    #[serde(with = "duration_secs")]
    pub retry_delays: Vec<Duration>,
    /// Upper bound on any single backoff delay
    #[serde(with = "duration_secs::single")]
    pub max_retry_delay: Duration,
    /// Failed attempts after which an entry stops retrying on its own
    pub max_retries: u32,
    /// Queue entries pushed per upload batch
    pub batch_size: usize,
    /// How long `error` entries are kept before being swept
    pub error_retention_seconds: u64,
    /// Rows removed at most per background eviction sweep
    pub eviction_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 50 * 1024 * 1024, // 50 MB
            max_records: 10_000,
            ttl_seconds: Some(7 * 24 * 60 * 60),
            sync_interval_seconds: 300,
            enable_auto_sync: true,
            retry_delays: [1, 2, 5, 10, 30, 60, 300]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            max_retry_delay: Duration::from_secs(15 * 60),
            max_retries: 5,
            batch_size: 50,
            error_retention_seconds: 7 * 24 * 60 * 60,
            eviction_batch_size: 500,
        }
    }
}

impl SyncConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batchSize must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig("maxRetries must be at least 1".into()));
        }
        if self.retry_delays.is_empty() {
            return Err(Error::InvalidConfig("retryDelays must not be empty".into()));
        }
        if self.max_records == 0 || self.max_size_bytes == 0 {
            return Err(Error::InvalidConfig(
                "maxRecords and maxSizeBytes must be positive".into(),
            ));
        }
        if self.eviction_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "evictionBatchSize must be at least 1".into(),
            ));
        }
        if self.enable_auto_sync && self.sync_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "syncIntervalSeconds must be positive when auto sync is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_seconds.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn error_retention(&self) -> Duration {
        Duration::from_secs(self.error_retention_seconds)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(value.iter().map(|d| d.as_secs_f64()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        let secs = Vec::<f64>::deserialize(d)?;
        secs.into_iter()
            .map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .collect()
    }

    pub mod single {
        use super::*;

        pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_f64(value.as_secs_f64())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
            let secs = f64::deserialize(d)?;
            Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let config = SyncConfig {
            batch_size: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn empty_retry_table_rejected() {
        let config = SyncConfig {
            retry_delays: vec![],
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let config = SyncConfig {
            ttl_seconds: Some(0),
            ..SyncConfig::default()
        };
        assert_eq!(config.ttl(), None);
    }

    #[test]
    fn deserializes_partial_camel_case() {
        let config: SyncConfig = serde_json::from_value(json!({
            "batchSize": 2,
            "ttlSeconds": 1,
            "retryDelays": [0.5, 1, 4],
            "maxRetryDelay": 3
        }))
        .unwrap();

        assert_eq!(config.batch_size, 2);
        assert_eq!(config.ttl(), Some(Duration::from_secs(1)));
        assert_eq!(
            config.retry_delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(config.max_retry_delay, Duration::from_secs(3));
        // untouched fields keep their defaults
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn negative_delay_rejected() {
        let result: std::result::Result<SyncConfig, _> =
            serde_json::from_value(json!({"retryDelays": [-1]}));
        assert!(result.is_err());
    }
}
