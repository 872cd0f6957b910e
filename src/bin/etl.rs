//! CLI entry point. Wires configuration, logging, the store connection,
//! and the trading calendar into a [`RuntimeContext`], then dispatches to
//! one of the three subcommands.
//!
//! Version dependencies:
//! - tokio = "1.28"
//! - clap = "4.4"
//! - anyhow = "1.0"

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use clap::Parser;
use tracing::{error, info, warn};

use ashare_etl::calendar::{CalendarEntry, CalendarError, CalendarSource, TradingCalendar};
use ashare_etl::cli::{exit_code, Cli, Command};
use ashare_etl::config::rate_limit::BucketOverride;
use ashare_etl::config::{self, AppConfig};
use ashare_etl::context::RuntimeContext;
use ashare_etl::fetcher::RetryPolicy;
use ashare_etl::guard::GuardError;
use ashare_etl::notify::{LogNotifier, Notifier, RunNotification, WebhookNotifier};
use ashare_etl::pipeline::{FailurePolicy, PipelineCoordinator, PipelineDefinition};
use ashare_etl::rate_limiter::RateLimiterRegistry;
use ashare_etl::registry;
use ashare_etl::types::TradeDate;
use ashare_etl::utils::logger::init_logger;
use ashare_etl::watermark::RunStatus;

#[tokio::main(worker_threads = 16)]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("fatal: {e:#}");
            ExitCode::from(exit_code::CONFIG_ERROR as u8)
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Command::Run { config, .. } | Command::Check { config, .. } | Command::Guard { config, .. } => config.clone(),
    };

    let app_config = config::init_config(&config_path)
        .map_err(|e| anyhow!("configuration error: {e}"))?;
    init_logger(&app_config.environment).ok();

    info!(version = %app_config.version, "ashare-etl starting");

    let start_trade_date = cli.command.start_trade_date();
    let end_trade_date = cli.command.end_trade_date();

    match cli.command {
        Command::Run { pipeline, lenient, .. } => {
            run_pipeline(&app_config, &pipeline, start_trade_date, end_trade_date, lenient).await
        }
        Command::Check { hours, .. } => check_freshness(&app_config, hours).await,
        Command::Guard { task_name, idempotency_key, retries, retry_delay, timeout, subcommand, .. } => {
            run_guarded(&app_config, &task_name, &idempotency_key, retries, retry_delay, timeout, subcommand).await
        }
    }
}

async fn build_context(app_config: &AppConfig) -> Result<Arc<RuntimeContext>> {
    let pool = app_config
        .store
        .connect()
        .await
        .context("failed to connect to store")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run pending migrations")?;

    let rate_limiter = RateLimiterRegistry::new();
    for (bucket, default) in [
        ("quote_api", BucketOverride { capacity: 10, refill_per_minute: 600 }),
        ("announcement_api", BucketOverride { capacity: 5, refill_per_minute: 300 }),
        ("reference_api", BucketOverride { capacity: 5, refill_per_minute: 300 }),
        ("margin_api", BucketOverride { capacity: 5, refill_per_minute: 300 }),
    ] {
        let resolved = app_config.rate_limit.for_bucket(bucket, default);
        rate_limiter.register(bucket, resolved.capacity, resolved.refill_per_minute);
    }

    let calendar_source: Box<dyn CalendarSource> = Box::new(StoreBackedCalendarSource { pool: pool.clone() });
    let calendar = TradingCalendar::new(calendar_source, ashare_etl::calendar::wall_clock_today());

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(app_config.batch.timeout_sec))
        .build()
        .context("failed to build HTTP client")?;

    let retry_policy = RetryPolicy {
        max_attempts: app_config.batch.retry_times.max(1),
        base_delay: app_config.batch.base_retry_delay(),
        max_delay: Duration::from_secs(30),
        attempt_timeout: app_config.batch.attempt_timeout(),
    };

    let notifier: Arc<dyn Notifier> = match std::env::var("NOTIFY_WEBHOOK_URL") {
        Ok(url) => Arc::new(WebhookNotifier::new(http_client.clone(), url)),
        Err(_) => Arc::new(LogNotifier),
    };

    let context = Arc::new(RuntimeContext::new(
        pool,
        calendar,
        rate_limiter,
        http_client,
        retry_policy,
        app_config.batch.batch_rows,
        ChronoDuration::minutes(30),
        notifier,
        app_config.environment.upstream_token.clone(),
        app_config.batch.concurrency,
    ));
    context.spawn_shutdown_listener();
    Ok(context)
}

async fn run_pipeline(
    app_config: &AppConfig,
    pipeline_name: &str,
    start_date: Option<TradeDate>,
    end_date_override: Option<TradeDate>,
    force_lenient: bool,
) -> Result<i32> {
    let Some((stages, default_policy)) = registry::pipeline_stages(pipeline_name) else {
        error!(pipeline = pipeline_name, "unknown pipeline");
        return Ok(exit_code::CONFIG_ERROR);
    };

    let context = build_context(app_config).await?;
    let policy = if force_lenient {
        FailurePolicy::Lenient
    } else {
        app_config.pipelines.policy_for(pipeline_name, default_policy)
    };

    let full_backfill_start =
        start_date.unwrap_or_else(|| TradeDate::new(20_100_104).expect("fixed historical start date is valid"));

    let definition = PipelineDefinition {
        name: pipeline_name,
        policy,
        stages: stages.clone(),
        full_backfill_start,
        end_date_override,
    };

    let request_id = uuid::Uuid::new_v4().to_string();
    let base_url = std::env::var("UPSTREAM_BASE_URL").unwrap_or_else(|_| "https://api.example-upstream.invalid".to_string());

    let report = PipelineCoordinator::run(&context, &base_url, &definition, &request_id).await;

    let notification = RunNotification::from_report(&report);
    context.notifier.notify(&notification).await;

    if report.is_success() {
        info!(pipeline = pipeline_name, "pipeline run succeeded");
        Ok(exit_code::SUCCESS)
    } else {
        warn!(pipeline = pipeline_name, failed = ?notification.failed_stages, "pipeline run failed");
        Ok(exit_code::STAGE_FAILURE)
    }
}

async fn check_freshness(app_config: &AppConfig, hours: u32) -> Result<i32> {
    let context = build_context(app_config).await?;
    let mut breached = Vec::new();

    for descriptor in registry::all_descriptors() {
        let today_cap = context.calendar.today_cap().await.context("failed to resolve today-cap")?;
        let watermark = context
            .watermark_store
            .read_or_init(descriptor.name, today_cap)
            .await
            .with_context(|| format!("failed to read watermark for {}", descriptor.name))?;

        let age_days = today_cap.as_i32().saturating_sub(watermark.water_mark.as_i32());
        let is_failed = watermark.status == RunStatus::Failed;
        if is_failed || age_days > (hours / 24).max(1) as i32 {
            breached.push(descriptor.name);
        }
    }

    if breached.is_empty() {
        info!("all watermarks within SLO");
        Ok(exit_code::SUCCESS)
    } else {
        warn!(apis = ?breached, hours, "watermark freshness SLO breached");
        Ok(exit_code::STAGE_FAILURE)
    }
}

async fn run_guarded(
    app_config: &AppConfig,
    task_name: &str,
    idempotency_key: &str,
    retries: u32,
    retry_delay_sec: u64,
    timeout_sec: u64,
    subcommand: Vec<String>,
) -> Result<i32> {
    let context = build_context(app_config).await?;
    let task_key = format!("{task_name}:{idempotency_key}");

    let lease = match context.run_guard.acquire(&task_key).await {
        Ok(lease) => lease,
        Err(GuardError::AlreadySatisfied { .. }) => {
            info!(task_key, "idempotency key already satisfied; skipping duplicate invocation");
            return Ok(exit_code::SKIPPED);
        }
        Err(e) => return Err(anyhow!("failed to acquire run guard: {e}")),
    };

    let Some((program, args)) = subcommand.split_first() else {
        return Ok(exit_code::CONFIG_ERROR);
    };

    let mut last_code = exit_code::STAGE_FAILURE;
    for attempt in 0..=retries {
        let status = tokio::time::timeout(
            Duration::from_secs(timeout_sec),
            tokio::process::Command::new(program).args(args).status(),
        )
        .await;

        match status {
            Ok(Ok(status)) if status.success() => {
                last_code = exit_code::SUCCESS;
                break;
            }
            Ok(Ok(status)) => {
                last_code = status.code().unwrap_or(exit_code::STAGE_FAILURE);
                warn!(attempt, code = last_code, "guarded subcommand exited non-zero");
            }
            Ok(Err(e)) => {
                error!(attempt, error = %e, "failed to spawn guarded subcommand");
                last_code = exit_code::CONFIG_ERROR;
            }
            Err(_) => {
                warn!(attempt, timeout_sec, "guarded subcommand timed out");
            }
        }

        if attempt < retries {
            tokio::time::sleep(Duration::from_secs(retry_delay_sec)).await;
        }
    }

    if last_code == exit_code::SUCCESS {
        lease.mark_success().await.map_err(|e| anyhow!("failed to mark run guard success: {e}"))?;
    } else {
        lease.mark_failed().await.map_err(|e| anyhow!("failed to mark run guard failure: {e}"))?;
    }
    Ok(last_code)
}

/// Loads trading-calendar rows from the `meta_etl_trading_calendar` table
/// (backfilled out of band from the exchange's published schedule, not
/// fetched live per run).
struct StoreBackedCalendarSource {
    pool: sqlx::PgPool,
}

#[async_trait]
impl CalendarSource for StoreBackedCalendarSource {
    async fn load_up_to(&self, horizon: TradeDate) -> Result<Vec<CalendarEntry>, CalendarError> {
        let rows = sqlx::query!(
            r#"SELECT trade_date, is_open FROM meta_etl_trading_calendar WHERE trade_date <= $1 ORDER BY trade_date"#,
            horizon.as_i32(),
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CalendarError::RefreshFailed(e.to_string()))?;

        rows.into_iter()
            .map(|r| {
                TradeDate::new(r.trade_date)
                    .map(|date| CalendarEntry { date, is_open: r.is_open })
                    .map_err(|e| CalendarError::RefreshFailed(e.to_string()))
            })
            .collect()
    }
}
