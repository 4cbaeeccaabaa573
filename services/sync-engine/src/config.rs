use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub los: LosConfig,
    #[serde(default)]
    pub sync: sync_core::Config,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LosConfig {
    /// Use the in-memory LOS instead of the Ventures API
    pub mock_mode: bool,
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// Seed demo loan applications linked to the mock portfolio
    pub seed_demo_loans: bool,
    /// Credentials configured at startup when none are on file
    #[serde(default)]
    pub bootstrap: Option<BootstrapCredentials>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BootstrapCredentials {
    pub username: String,
    pub password: String,
    pub site_name: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8090)?
            .set_default("server.workers", 4)?
            .set_default("los.mock_mode", true)?
            .set_default("los.base_url", "https://api.venturesgo.com/api/v4")?
            .set_default("los.request_timeout_ms", 10_000)?
            .set_default("los.seed_demo_loans", true)?
            .set_default("sync.data_dir", "./data/los-sync")?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("SYNC_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        // Special handling for common env vars
        if let Ok(mock_mode) = env::var("VENTURES_MOCK_MODE") {
            builder = builder.set_override("los.mock_mode", mock_mode)?;
        }

        if let Ok(base_url) = env::var("VENTURES_BASE_URL") {
            builder = builder.set_override("los.base_url", base_url)?;
        }

        if let Ok(data_dir) = env::var("LOS_SYNC_DATA_DIR") {
            builder = builder.set_override("sync.data_dir", data_dir)?;
        }

        if let Ok(port) = env::var("SYNC_ENGINE_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.sync.data_dir.as_os_str().is_empty() {
            return Err("Sync data directory is required".to_string());
        }

        if self.sync.worker.max_in_flight == 0 {
            return Err("Worker max_in_flight must be at least 1".to_string());
        }

        if !self.los.mock_mode && self.los.base_url.trim().is_empty() {
            return Err("LOS base URL is required outside mock mode".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8090,
                workers: 1,
            },
            los: LosConfig {
                mock_mode: true,
                base_url: String::new(),
                request_timeout_ms: 1_000,
                seed_demo_loans: false,
                bootstrap: None,
            },
            sync: sync_core::Config::default(),
        }
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mut config = sample();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.sync.worker.max_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.los.mock_mode = false;
        assert_eq!(
            config.validate().unwrap_err(),
            "LOS base URL is required outside mock mode"
        );
    }

    #[test]
    fn test_sync_section_defaults_when_absent() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "server": {"host": "0.0.0.0", "port": 8090, "workers": 2},
            "los": {
                "mock_mode": true,
                "base_url": "http://localhost",
                "request_timeout_ms": 500,
                "seed_demo_loans": true
            }
        }))
        .unwrap();

        assert_eq!(config.sync.retry.max_retries, 3);
        assert!(config.los.bootstrap.is_none());
    }
}
