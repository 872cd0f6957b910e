//! Per-bucket token-bucket rate limiter shared across all concurrent
//! Fetchers in the process. FIFO ordering is inherited from
//! `tokio::sync::Semaphore`'s documented fair-wake behavior, which is what
//! prevents starvation.
//!
//! Version dependencies:
//! - tokio = "1.28"
//! - dashmap = "5.5"
//! - tracing = "0.1"

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// One named token bucket: `capacity` tokens, refilled to `capacity` every
/// minute at a rate of `refill_per_minute` tokens, via a background refill
/// task spawned at bucket creation.
struct TokenBucket {
    semaphore: Arc<Semaphore>,
    refill_per_minute: u32,
}

/// A process-wide set of independent named buckets.
#[derive(Clone, Default)]
pub struct RateLimiterRegistry {
    buckets: Arc<DashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a bucket if it doesn't already exist. Idempotent so
    /// multiple stages can declare the same bucket without clobbering its
    /// in-flight state.
    pub fn register(&self, name: &str, capacity: u32, refill_per_minute: u32) {
        if self.buckets.contains_key(name) {
            return;
        }
        let semaphore = Arc::new(Semaphore::new(capacity as usize));
        let bucket = Arc::new(TokenBucket {
            semaphore: semaphore.clone(),
            refill_per_minute,
        });
        self.buckets.insert(name.to_string(), bucket);
        spawn_refill_task(name.to_string(), semaphore, capacity, refill_per_minute);
    }

    /// Blocks the caller until `n` tokens are available on `bucket`.
    /// Unregistered buckets are treated as unlimited (a misconfiguration
    /// the caller should have caught via `rate_limit.<bucket>` config
    /// validation, not a reason to deadlock a fetch).
    pub async fn acquire(&self, bucket: &str, n: u32) {
        let Some(b) = self.buckets.get(bucket).map(|e| e.value().clone()) else {
            warn!(bucket, "acquiring from unregistered rate-limit bucket; treating as unlimited");
            return;
        };
        match b.semaphore.acquire_many(n).await {
            Ok(permit) => permit.forget(),
            Err(_) => unreachable!("rate limiter semaphores are never closed"),
        }
    }

    /// Non-blocking variant: returns `true` and consumes `n` tokens if
    /// immediately available, `false` otherwise.
    pub fn try_acquire(&self, bucket: &str, n: u32) -> bool {
        let Some(b) = self.buckets.get(bucket).map(|e| e.value().clone()) else {
            return true;
        };
        match b.semaphore.try_acquire_many(n) {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn refill_rate(&self, bucket: &str) -> Option<u32> {
        self.buckets.get(bucket).map(|b| b.refill_per_minute)
    }
}

fn spawn_refill_task(name: String, semaphore: Arc<Semaphore>, capacity: u32, refill_per_minute: u32) {
    if refill_per_minute == 0 {
        return;
    }
    // Refill in small slices spread across the minute rather than one
    // lump sum at:00, so the limiter's sliding-window guarantee
    // holds even if a caller checks mid-minute.
    let slices: u32 = 6;
    let per_slice = (refill_per_minute / slices).max(1);
    let period = Duration::from_secs(60) / slices;

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let available = semaphore.available_permits() as u32;
            let headroom = capacity.saturating_sub(available);
            let grant = per_slice.min(headroom);
            if grant > 0 {
                semaphore.add_permits(grant as usize);
                debug!(bucket = %name, grant, "refilled rate-limit bucket");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn acquire_blocks_until_tokens_available() {
        let registry = RateLimiterRegistry::new();
        registry.register("test_bucket", 1, 60);

        registry.acquire("test_bucket", 1).await;
        assert!(!registry.try_acquire("test_bucket", 1));
    }

    #[tokio::test]
    async fn try_acquire_is_non_blocking() {
        let registry = RateLimiterRegistry::new();
        registry.register("test_bucket", 2, 60);

        assert!(registry.try_acquire("test_bucket", 2));
        assert!(!registry.try_acquire("test_bucket", 1));
    }

    #[tokio::test]
    async fn unregistered_bucket_is_unlimited() {
        let registry = RateLimiterRegistry::new();
        let started = Instant::now();
        registry.acquire("never_registered", 1000).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
