//! Structured logging setup. JSON output in production, human-readable
//! compact output otherwise, selected from [`crate::config::EnvironmentConfig`].
//!
//! Version dependencies:
//! - tracing = "0.1"
//! - tracing-subscriber = "0.3"

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::environment::EnvironmentConfig;

static INIT: Once = Once::new();

/// Installs the global tracing subscriber. Safe to call more than once;
/// only the first call takes effect (mirrors how `main` and integration
/// tests both want to call this without coordinating).
pub fn init_logger(config: &EnvironmentConfig) -> Result<(), Box<dyn std::error::Error>> {
    INIT.call_once(|| {
        let filter = EnvFilter::try_new(&config.log_level)
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(!config.is_production())
            .with_line_number(!config.is_production());

        let result = if config.is_production() {
            subscriber.json().try_init()
        } else {
            subscriber.compact().try_init()
        };

        if let Err(e) = result {
            eprintln!("failed to install tracing subscriber: {e}");
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logger_is_idempotent() {
        let config = EnvironmentConfig::from_env_or_default();
        assert!(init_logger(&config).is_ok());
        assert!(init_logger(&config).is_ok());
    }
}
