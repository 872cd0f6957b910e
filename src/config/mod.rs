//! Root configuration module: assembles environment, store, batch,
//! per-pipeline, and per-rate-limit-bucket settings into one `AppConfig`,
//! loaded once at process startup.
//!
//! Version dependencies:
//! - serde = "1.0"
//! - toml = "0.8"
//! - tracing = "0.1"

pub mod batch;
pub mod database;
pub mod environment;
pub mod pipeline;
pub mod rate_limit;

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, instrument};

use batch::BatchConfig;
use database::StoreConfig;
use environment::EnvironmentConfig;
use pipeline::PipelineOverrides;
use rate_limit::RateLimitConfig;

const CONFIG_VERSION: &str = "1.0.0";

/// The subset of `AppConfig` that is actually read from the TOML file on
/// disk; `environment` is sourced from process env instead.
#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    store: StoreFileSection,
    #[serde(default)]
    batch: BatchConfig,
    #[serde(default)]
    pipeline: PipelineOverrides,
    #[serde(default)]
    rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct StoreFileSection {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    user: String,
    password: String,
    database: String,
    #[serde(default)]
    pool_size: Option<u32>,
}

fn default_port() -> u16 {
    5432
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: EnvironmentConfig,
    pub store: StoreConfig,
    pub batch: BatchConfig,
    pub pipelines: PipelineOverrides,
    pub rate_limit: RateLimitConfig,
    pub version: String,
    pub loaded_at: DateTime<Utc>,
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment.is_production()
    }
}

/// Loads `AppConfig` from a TOML file plus process environment. The only
/// entrypoint into configuration; called once from `main`.
#[instrument]
pub fn init_config(path: &Path) -> Result<AppConfig, String> {
    info!(path = %path.display(), "loading configuration");

    let contents = std::fs::read_to_string(path)
    .map_err(|e| format!("failed to read config file {}: {e}", path.display()))?;
    let file: FileConfig = toml::from_str(&contents)
    .map_err(|e| format!("failed to parse config file {}: {e}", path.display()))?;

    let environment = EnvironmentConfig::from_env_or_default();

    let mut store: StoreConfig = StoreConfig {
        host: file.store.host,
        port: file.store.port,
        user: file.store.user,
        password: file.store.password,
        database: file.store.database,
        ..StoreConfig::default()
    };
    if let Some(pool_size) = file.store.pool_size {
        store.pool_size = pool_size;
    }

    let config = AppConfig {
        environment,
        store,
        batch: file.batch,
        pipelines: file.pipeline,
        rate_limit: file.rate_limit,
        version: CONFIG_VERSION.to_string(),
        loaded_at: Utc::now(),
    };

    validate_config(&config)?;
    Ok(config)
}

#[instrument(skip(config))]
pub fn validate_config(config: &AppConfig) -> Result<(), String> {
    config.store.validate()?;
    if config.batch.concurrency == 0 {
        return Err("batch.concurrency must be at least 1".to_string());
    }
    if config.is_production() && config.environment.upstream_token.is_none() {
        return Err("production deployments must set UPSTREAM_API_TOKEN".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_config_missing_store_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[batch]\nconcurrency = 4\n").unwrap();
        let result = init_config(file.path());
        assert!(result.is_err());
    }

    #[test]
    fn loads_a_minimal_valid_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
 [store]
 host = "localhost"
 user = "etl"
 password = "secret"
 database = "ashare"
 "#
        )
        .unwrap();
        let config = init_config(file.path()).unwrap();
        assert_eq!(config.store.database, "ashare");
        assert_eq!(config.batch.retry_times, 3);
    }
}
