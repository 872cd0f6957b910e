//! Tunables for the fetch/retry loop and the concurrency of the worker
//! pool that fans stage execution out across APIs.
//!
//! Version dependencies:
//! - serde = "1.0"

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub timeout_sec: u64,
    pub retry_times: u32,
    pub retry_delay_sec: u64,
    pub concurrency: usize,
    pub batch_rows: usize,
}

impl BatchConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_sec)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            timeout_sec: 60,
            retry_times: 3,
            retry_delay_sec: 1,
            concurrency: 4,
            batch_rows: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_for_a_single_upstream() {
        let config = BatchConfig::default();
        assert_eq!(config.retry_times, 3);
        assert!(config.concurrency > 0);
    }
}
