//! Process-wide environment: which deployment this is and what that
//! implies for logging format and upstream secrets. Loaded once via
//! `dotenvy` + manual `env::var` reads.
//!
//! Version dependencies:
//! - dotenvy = "0.15"
//! - tracing = "0.1"

use std::env;

use tracing::{info, warn};

pub const PRODUCTION_ENV: &str = "production";
pub const STAGING_ENV: &str = "staging";
pub const DEVELOPMENT_ENV: &str = "development";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub etl_env: String,
    pub log_level: String,
    /// Bearer token or API key attached to every upstream request. Kept
    /// here rather than in a dedicated security module: the core engine
    /// has no inbound surface of its own to secure, only this one
    /// outbound secret.
    pub upstream_token: Option<String>,
}

impl EnvironmentConfig {
    pub fn is_production(&self) -> bool {
        self.etl_env == PRODUCTION_ENV
    }

    pub fn is_staging(&self) -> bool {
        self.etl_env == STAGING_ENV
    }

    pub fn is_development(&self) -> bool {
        self.etl_env == DEVELOPMENT_ENV
    }

    pub fn from_env_or_default() -> Self {
        let _ = dotenvy::dotenv();

        let etl_env = env::var("ETL_ENV").unwrap_or_else(|_| DEVELOPMENT_ENV.to_string());
        if ![PRODUCTION_ENV, STAGING_ENV, DEVELOPMENT_ENV].contains(&etl_env.as_str()) {
            warn!(etl_env, "unrecognized ETL_ENV value, defaulting log format to development");
        }

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
        let upstream_token = env::var("UPSTREAM_API_TOKEN").ok();

        if etl_env == PRODUCTION_ENV && upstream_token.is_none() {
            warn!("running in production with no UPSTREAM_API_TOKEN set");
        }

        info!(etl_env, log_level, "environment configuration loaded");
        Self { etl_env, log_level, upstream_token }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_etl_env_defaults_to_development() {
        // SAFETY: tests run single-threaded per process here and this is
        // the only test touching ETL_ENV.
        env::remove_var("ETL_ENV");
        let config = EnvironmentConfig::from_env_or_default();
        assert!(config.is_development());
    }
}
