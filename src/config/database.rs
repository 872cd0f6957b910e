//! Postgres store connection configuration: host/credentials and pool
//! construction knobs, built with `sqlx::PgPoolOptions` (see DESIGN.md
//! for why the dual deadpool_postgres/sqlx split this was adapted from
//! isn't carried over).
//!
//! Version dependencies:
//! - sqlx = "0.7"
//! - tracing = "0.1"

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tracing::{info, instrument};

const DEFAULT_POOL_SIZE: u32 = 10;
const DEFAULT_TIMEOUT_SECONDS: u32 = 30;
const MIN_POOL_SIZE: u32 = 1;
const MAX_POOL_SIZE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Require,
    VerifyCa,
    VerifyFull,
}

impl From<SslMode> for PgSslMode {
    fn from(mode: SslMode) -> Self {
        match mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub pool_size: u32,
    pub timeout_seconds: u32,
    pub ssl_mode: SslMode,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() || self.user.is_empty() || self.database.is_empty() {
            return Err("store config missing required host/user/database".to_string());
        }
        if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&self.pool_size) {
            return Err(format!(
                "pool size must be between {MIN_POOL_SIZE} and {MAX_POOL_SIZE}, got {}",
                self.pool_size
            ));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        self.validate()
            .map_err(|e| sqlx::Error::Configuration(e.into()))?;

        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(self.ssl_mode.into());

        let pool = PgPoolOptions::new()
            .max_connections(self.pool_size)
            .acquire_timeout(std::time::Duration::from_secs(self.timeout_seconds as u64))
            .connect_with(options)
            .await?;

        info!(host = self.host, pool_size = self.pool_size, "connected to store");
        Ok(pool)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            pool_size: DEFAULT_POOL_SIZE,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            ssl_mode: SslMode::Require,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_required_fields() {
        let config = StoreConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_pool_size_out_of_range() {
        let config = StoreConfig {
            host: "db".into(),
            user: "etl".into(),
            database: "ashare".into(),
            pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
