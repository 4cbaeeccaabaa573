//! Configuration for the sync subsystem

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the SQLite store
    pub data_dir: PathBuf,

    /// Retry/backoff policy for failed items
    pub retry: RetryConfig,

    /// Background worker configuration
    pub worker: WorkerConfig,

    /// Dashboard configuration
    pub dashboard: DashboardConfig,

    /// Field comparison configuration
    pub reconciliation: ReconciliationConfig,

    /// Circuit breaker guarding LOS calls
    pub breaker: BreakerConfig,

    /// How long `POST /sync` waits for the item to resolve (milliseconds)
    pub sync_wait_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/los-sync"),
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            dashboard: DashboardConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            breaker: BreakerConfig::default(),
            sync_wait_ms: 10_000,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry (ms)
    pub initial_delay_ms: u64,

    /// Upper bound for any delay (ms)
    pub max_delay_ms: u64,

    /// Growth factor per retry
    pub backoff_multiplier: f64,

    /// +/- fraction of the delay added as jitter
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 2000,  // 2 seconds
            max_delay_ms: 30000,     // 30 seconds
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,      // 10% jitter
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Poll interval (ms)
    pub poll_interval_ms: u64,

    /// Items executed concurrently per iteration
    pub max_in_flight: usize,

    /// Budget for a single LOS call (ms)
    pub call_timeout_ms: u64,

    /// Budget for a whole item execution (ms)
    pub item_timeout_ms: u64,

    /// Queue actor mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_in_flight: 4,
            call_timeout_ms: 10_000,
            item_timeout_ms: 30_000,
            mailbox_capacity: 1000,
        }
    }
}

impl WorkerConfig {
    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Single LOS call budget
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Whole item budget
    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }
}

/// Dashboard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Heartbeat age after which sync is reported stale (seconds)
    pub stale_after_seconds: i64,

    /// Log entries shown on the dashboard
    pub recent_logs_limit: usize,

    /// Log entries shown per loan
    pub loan_logs_limit: usize,

    /// Dead-letter entries listed
    pub dlq_limit: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            stale_after_seconds: 300,
            recent_logs_limit: 20,
            loan_logs_limit: 20,
            dlq_limit: 50,
        }
    }
}

/// Field comparison configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Largest currency difference still treated as a match
    pub currency_tolerance: Decimal,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            currency_tolerance: Decimal::new(1, 2), // 0.01
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Successes in half-open needed to close again
    pub recovery_threshold: u32,

    /// Seconds the circuit stays open before probing
    pub reset_timeout_seconds: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 1,
            reset_timeout_seconds: 60,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Settings(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LOS_SYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(value) = std::env::var("LOS_SYNC_STALE_SECONDS") {
            config.dashboard.stale_after_seconds = value
                .parse()
                .map_err(|_| crate::Error::Settings(format!("Invalid stale seconds: {}", value)))?;
        }

        if let Ok(value) = std::env::var("LOS_SYNC_MAX_RETRIES") {
            config.retry.max_retries = value
                .parse()
                .map_err(|_| crate::Error::Settings(format!("Invalid max retries: {}", value)))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.worker.max_in_flight, 4);
        assert_eq!(config.dashboard.stale_after_seconds, 300);
        assert_eq!(config.reconciliation.currency_tolerance, Decimal::new(1, 2));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/los-sync"

            [retry]
            max_retries = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/los-sync"));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay_ms, 2000);
        assert_eq!(config.worker.poll_interval_ms, 2000);
    }
}
