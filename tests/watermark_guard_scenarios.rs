//! Watermark/run-guard scenarios against a real Postgres instance.
//! Requires `DATABASE_URL`; skipped otherwise rather than failing, since
//! this suite exercises migrations and transactional behavior a mocked
//! store can't stand in for.

use ashare_etl::guard::{GuardError, RunGuard};
use ashare_etl::run_log::{RunLog, RunOutcome};
use ashare_etl::types::TradeDate;
use ashare_etl::watermark::{RunStatus, WatermarkStore};
use chrono::Duration as ChronoDuration;
use sqlx::PgPool;

async fn connect_or_skip() -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping store-backed scenario test");
        return None;
    };
    let pool = PgPool::connect(&url).await.expect("failed to connect to test database");
    sqlx::migrate!("./migrations").run(&pool).await.expect("failed to run migrations");
    Some(pool)
}

/// Scenario A: a brand-new API is initialized at its configured backfill
/// start and only advances as far as the calendar's today-cap.
#[tokio::test]
async fn watermark_never_advances_past_today_cap() {
    let Some(pool) = connect_or_skip().await else { return };
    let store = WatermarkStore::new(pool);
    let api = format!("scenario_a_{}", uuid::Uuid::new_v4());

    let cap = TradeDate::new(20240111).unwrap();
    store.read_or_init(&api, TradeDate::new(20240108).unwrap()).await.unwrap();

    let result = store.advance(&api, TradeDate::new(20240115).unwrap(), cap).await;
    assert!(result.is_err(), "advancing past today-cap must be refused");
}

/// Scenario C: a failed run leaves the watermark value untouched, only
/// the status and error message change.
#[tokio::test]
async fn failed_run_does_not_move_the_watermark_value() {
    let Some(pool) = connect_or_skip().await else { return };
    let store = WatermarkStore::new(pool);
    let api = format!("scenario_c_{}", uuid::Uuid::new_v4());

    let initial = TradeDate::new(20240108).unwrap();
    store.read_or_init(&api, initial).await.unwrap();
    store.mark_running(&api).await.unwrap();
    store.mark_failed(&api, "upstream timed out").await.unwrap();

    let row = store.read_or_init(&api, initial).await.unwrap();
    assert_eq!(row.water_mark, initial);
    assert_eq!(row.status, RunStatus::Failed);
}

/// Scenario D: a second process attempting to run the same API while a
/// lease is held is rejected outright.
#[tokio::test]
async fn concurrent_run_is_rejected_by_the_guard() {
    let Some(pool) = connect_or_skip().await else { return };
    let guard = RunGuard::new(pool, ChronoDuration::minutes(30));
    let api = format!("scenario_d_{}", uuid::Uuid::new_v4());

    let _lease = guard.acquire(&api).await.unwrap();
    let second = guard.acquire(&api).await;
    assert!(second.is_err(), "a live lease must reject a concurrent acquire");
}

/// Invariant 3, as seen from the Stage Runner's perspective: a watermark
/// freshly marked RUNNING by a live run_log entry is reported as
/// concurrently running; once that run_log entry is closed, the same
/// watermark is reclaimable instead.
#[tokio::test]
async fn is_concurrently_running_reflects_run_log_liveness() {
    let Some(pool) = connect_or_skip().await else { return };
    let store = WatermarkStore::new(pool.clone());
    let run_log = RunLog::new(pool.clone());
    let guard = RunGuard::new(pool, ChronoDuration::minutes(30));
    let api = format!("scenario_invariant3_{}", uuid::Uuid::new_v4());

    store.read_or_init(&api, TradeDate::new(20240108).unwrap()).await.unwrap();
    store.mark_running(&api).await.unwrap();
    let run_id = run_log.open(&api).await.unwrap();

    assert!(guard.is_concurrently_running(&api, &store, &run_log).await.unwrap());

    run_log.close(run_id, RunOutcome::Success, 10, None).await.unwrap();
    assert!(!guard.is_concurrently_running(&api, &store, &run_log).await.unwrap());
}

/// Scenario F: a watermark stuck at RUNNING with no live run log entry is
/// reclaimed as a crashed run rather than left stuck forever.
#[tokio::test]
async fn zombie_watermark_is_reclaimed_when_no_run_log_entry_exists() {
    let Some(pool) = connect_or_skip().await else { return };
    let store = WatermarkStore::new(pool.clone());
    let run_log = RunLog::new(pool.clone());
    let guard = RunGuard::new(pool, ChronoDuration::minutes(30));
    let api = format!("scenario_f_{}", uuid::Uuid::new_v4());

    store.read_or_init(&api, TradeDate::new(20240108).unwrap()).await.unwrap();
    store.mark_running(&api).await.unwrap();

    let reclaimed = guard.reconcile_zombies(&api, &store, &run_log).await.unwrap();
    assert!(reclaimed);

    let row = store.read_or_init(&api, TradeDate::new(20240108).unwrap()).await.unwrap();
    assert_eq!(row.status, RunStatus::Failed);
}

/// Scenario E: a prior invocation under the same task key already
/// succeeded; a later invocation under the same key is refused outright
/// rather than re-running.
#[tokio::test]
async fn idempotency_guard_skips_a_key_that_already_succeeded() {
    let Some(pool) = connect_or_skip().await else { return };
    let guard = RunGuard::new(pool, ChronoDuration::minutes(30));
    let task_key = format!("daily_pipeline:20240111:{}", uuid::Uuid::new_v4());

    let lease = guard.acquire(&task_key).await.unwrap();
    lease.mark_success().await.unwrap();

    let second = guard.acquire(&task_key).await;
    assert!(matches!(second, Err(GuardError::AlreadySatisfied {.. })));
}

/// A task key that previously failed is retryable: a later invocation
/// under the same key acquires a fresh lease rather than being refused.
#[tokio::test]
async fn idempotency_guard_allows_retry_after_a_prior_failure() {
    let Some(pool) = connect_or_skip().await else { return };
    let guard = RunGuard::new(pool, ChronoDuration::minutes(30));
    let task_key = format!("daily_pipeline:20240112:{}", uuid::Uuid::new_v4());

    let lease = guard.acquire(&task_key).await.unwrap();
    lease.mark_failed().await.unwrap();

    let second = guard.acquire(&task_key).await;
    assert!(second.is_ok(), "a FAILED task key must be retryable");
}

/// A run-log entry that closed normally is not treated as a zombie even
/// though the watermark happens to read RUNNING (the brief window between
/// the writer committing and the watermark update in the same stage run).
#[tokio::test]
async fn run_log_closed_outcome_is_not_reclaimed_as_stale() {
    let Some(pool) = connect_or_skip().await else { return };
    let store = WatermarkStore::new(pool.clone());
    let run_log = RunLog::new(pool.clone());
    let guard = RunGuard::new(pool, ChronoDuration::minutes(30));
    let api = format!("scenario_f2_{}", uuid::Uuid::new_v4());

    store.read_or_init(&api, TradeDate::new(20240108).unwrap()).await.unwrap();
    store.mark_running(&api).await.unwrap();
    let run_id = run_log.open(&api).await.unwrap();
    run_log.close(run_id, RunOutcome::Success, 10, None).await.unwrap();

    let reclaimed = guard.reconcile_zombies(&api, &store, &run_log).await.unwrap();
    assert!(reclaimed, "a finished run log entry still means the watermark update is overdue, not in-flight");
}
