//! Explicit runtime context: every long-lived collaborator the engine
//! needs, constructed once at process startup and threaded through by
//! reference.
//!
//! Version dependencies:
//! - tokio = "1.28"
//! - tokio-util = "0.7"
//! - sqlx = "0.7"
//! - reqwest = "0.11"

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::calendar::TradingCalendar;
use crate::fetcher::{Fetcher, RetryPolicy};
use crate::guard::RunGuard;
use crate::notify::Notifier;
use crate::quality::QualityChecker;
use crate::rate_limiter::RateLimiterRegistry;
use crate::run_log::RunLog;
use crate::utils::metrics::EtlMetrics;
use crate::watermark::WatermarkStore;
use crate::writer::Writer;

/// Everything a stage/pipeline run needs, built once in `main` and shared
/// by `Arc` across concurrently running pipelines.
pub struct RuntimeContext {
    pub pool: PgPool,
    pub calendar: TradingCalendar,
    pub rate_limiter: RateLimiterRegistry,
    pub fetcher: Fetcher,
    pub writer: Writer,
    pub watermark_store: WatermarkStore,
    pub run_log: RunLog,
    pub run_guard: RunGuard,
    pub quality_checker: QualityChecker,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: EtlMetrics,
    pub shutdown: CancellationToken,
    /// Bound on concurrent in-flight per-date fetches within one ingest
    /// stage (`spec.md` §5's "small worker pool (bounded, default 2-4)").
    pub fetch_concurrency: usize,
}

impl RuntimeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        calendar: TradingCalendar,
        rate_limiter: RateLimiterRegistry,
        http_client: reqwest::Client,
        retry_policy: RetryPolicy,
        batch_rows: usize,
        stale_lease_after: ChronoDuration,
        notifier: Arc<dyn Notifier>,
        upstream_token: Option<String>,
        fetch_concurrency: usize,
    ) -> Self {
        let fetcher = Fetcher::new(http_client, rate_limiter.clone(), retry_policy).with_bearer_token(upstream_token);
        let writer = Writer::new(pool.clone()).with_batch_rows(batch_rows);
        let watermark_store = WatermarkStore::new(pool.clone());
        let run_log = RunLog::new(pool.clone());
        let run_guard = RunGuard::new(pool.clone(), stale_lease_after);
        let quality_checker = QualityChecker::new(pool.clone());

        Self {
            pool,
            calendar,
            rate_limiter,
            fetcher,
            writer,
            watermark_store,
            run_log,
            run_guard,
            quality_checker,
            notifier,
            metrics: EtlMetrics::new(),
            shutdown: CancellationToken::new(),
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    /// Listens for SIGINT/SIGTERM and cancels `shutdown`, letting in-flight
    /// stages finish their current page before the pipeline loop exits.
    pub fn spawn_shutdown_listener(self: &Arc<Self>) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, cancelling in-flight work");
            token.cancel();
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

pub fn default_attempt_timeout() -> StdDuration {
    StdDuration::from_secs(60)
}
