//! Per-bucket token-bucket tunables loaded from the TOML config file
//! (`spec.md` §6, `rate_limit.<bucket>` -- tokens/minute per bucket).
//! Stage/transform/check registration decides *which* buckets exist
//! (`registry.rs`'s `ApiDescriptor::rate_bucket`); this module only makes
//! their capacity and refill rate operator-tunable instead of hardcoded.
//!
//! Version dependencies:
//! - serde = "1.0"
//! - toml = "0.8"

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BucketOverride {
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill_per_minute")]
    pub refill_per_minute: u32,
}

fn default_capacity() -> u32 {
    5
}

fn default_refill_per_minute() -> u32 {
    300
}

impl Default for BucketOverride {
    fn default() -> Self {
        Self { capacity: default_capacity(), refill_per_minute: default_refill_per_minute() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RateLimitConfig {
    #[serde(flatten)]
    pub by_bucket: HashMap<String, BucketOverride>,
}

impl RateLimitConfig {
    /// Resolves the effective `(capacity, refill_per_minute)` for `bucket`,
    /// falling back to `default` when no `[rate_limit.<bucket>]` table is
    /// configured.
    pub fn for_bucket(&self, bucket: &str, default: BucketOverride) -> BucketOverride {
        self.by_bucket.get(bucket).copied().unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_bucket_falls_back_to_the_given_default() {
        let config = RateLimitConfig::default();
        let fallback = BucketOverride { capacity: 10, refill_per_minute: 600 };
        assert_eq!(config.for_bucket("quote_api", fallback).capacity, 10);
    }

    #[test]
    fn configured_bucket_overrides_the_default() {
        let mut by_bucket = HashMap::new();
        by_bucket.insert("quote_api".to_string(), BucketOverride { capacity: 20, refill_per_minute: 1200 });
        let config = RateLimitConfig { by_bucket };
        let fallback = BucketOverride { capacity: 10, refill_per_minute: 600 };
        let resolved = config.for_bucket("quote_api", fallback);
        assert_eq!(resolved.capacity, 20);
        assert_eq!(resolved.refill_per_minute, 1200);
    }
}
