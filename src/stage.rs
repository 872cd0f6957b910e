//! One stage: resolves the date range still owed to an API, fetches and
//! writes it page by page, and advances the watermark. A
//! stage is a tagged-variant [`StageKind`] dispatched by the pipeline, not
//! a trait object hierarchy.
//!
//! Version dependencies:
//! - tokio = "1.28"
//! - tracing = "0.1"
//! - thiserror = "1.0"

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::calendar::{CalendarError, TradingCalendar};
use crate::fetcher::{FetchError, FetchParam, Fetcher};
use crate::guard::{GuardError, RunGuard};
use crate::page::PageSchema;
use crate::quality::{Assertion, CheckSpec, QualityChecker, QualityError, Severity};
use crate::run_log::{RunLog, RunLogError, RunOutcome};
use crate::transform::{TransformError, TransformSpec};
use crate::types::{ApiDescriptor, CursorKind, DateRange, TradeDate};
use crate::utils::metrics::EtlMetrics;
use crate::watermark::{WatermarkError, WatermarkStore};
use crate::writer::{WriteError, Writer};

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error(transparent)]
    Watermark(#[from] WatermarkError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    RunLog(#[from] RunLogError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Quality(#[from] QualityError),
    /// Invariant 3: another RUNNING run log row for this API is still live.
    /// Raised before the run log is touched at all.
    #[error("{api_name} already has a live run in flight")]
    ConcurrentRun { api_name: String },
    /// A HIGH-severity (`Severity::Error`) assertion failed in a check
    /// stage; strict pipelines treat this as a stage failure (`spec.md`
    /// §7, error kind 6).
    #[error("{name}: one or more HIGH-severity quality assertions failed")]
    QualityGateFailed { name: String },
    /// The shutdown signal fired mid-stage. Any rows already fetched and
    /// written before the signal arrived are kept and the watermark is
    /// advanced to cover them; nothing further is attempted.
    #[error("{name}: cancelled by shutdown signal")]
    Cancelled { name: String },
}

/// What one stage run actually did, reported to the pipeline coordinator
/// for its success/failure policy decision.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub api_name: String,
    pub rows_written: usize,
    /// `true` when there was nothing owed (watermark already at cap) —
    /// distinguished from a successful fetch so run logs and notifications
    /// can say "up to date" rather than "0 rows written".
    pub no_op: bool,
}

/// Tagged-variant dispatch over the three cursor shapes an API can have
///. Each variant carries only what that cursor kind needs;
/// adding a fourth kind means adding a variant here, not a new trait impl
/// scattered across the crate.
pub enum StageKind<'a> {
    ByTradeDate { full_backfill_start: TradeDate },
    ByAnnouncementDate { full_backfill_start: TradeDate },
    ByEntityId { entity_codes: &'a [String] },
}

pub struct StageRunner<'a> {
    pub descriptor: &'a ApiDescriptor,
    pub base_url: &'a str,
    pub calendar: &'a TradingCalendar,
    pub watermark_store: &'a WatermarkStore,
    pub run_log: &'a RunLog,
    pub run_guard: &'a RunGuard,
    pub fetcher: &'a Fetcher,
    pub writer: &'a Writer,
    pub metrics: &'a EtlMetrics,
    pub quality_checker: &'a QualityChecker,
    pub cancellation: &'a CancellationToken,
    /// Bound on concurrent in-flight per-date fetches (`spec.md` §5).
    pub fetch_concurrency: usize,
    /// An explicit `--end-date` override clamping the effective ceiling
    /// below the calendar's own today-cap.
    pub end_date_override: Option<TradeDate>,
}

impl<'a> StageRunner<'a> {
    /// Runs one stage end to end: resolve owed range, mark the watermark
    /// RUNNING, fetch+write every date/entity in range, advance the
    /// watermark, close the run log. The watermark advances through
    /// whatever contiguous prefix of the range actually got written, even
    /// when a failure or a shutdown signal cuts the range short midway
    /// (spec.md §8 Scenario B).
    #[instrument(skip(self, kind), fields(api = self.descriptor.name))]
    pub async fn run(&self, kind: StageKind<'_>, request_id: &str) -> Result<StageOutcome, StageError> {
        if self.cancellation.is_cancelled() {
            return Err(StageError::Cancelled { name: self.descriptor.name.to_string() });
        }
        let today_cap = self.calendar.today_cap().await?;
        let effective_cap = match self.end_date_override {
            Some(d) => today_cap.min(d),
            None => today_cap,
        };

        // Invariant 3: reject outright, before the run log is touched, if
        // another run for this API is genuinely still in flight. A watermark
        // stuck at RUNNING with no live run log entry is reclaimed instead
        // of rejected.
        if self
        .run_guard
        .is_concurrently_running(self.descriptor.name, self.watermark_store, self.run_log)
        .await?
        {
            return Err(StageError::ConcurrentRun { api_name: self.descriptor.name.to_string() });
        }

        // Lazily initialized to the configured start-date minus one trading
        // day (spec.md §3, "Lifecycle") so a genuinely first run starts
        // processing from `full_backfill_start` forward, not from
        // today-cap.
        let seed = match &kind {
            StageKind::ByTradeDate { full_backfill_start } | StageKind::ByAnnouncementDate { full_backfill_start } => {
                full_backfill_start.pred()
            }
            StageKind::ByEntityId { .. } => today_cap,
        };
        let current = self
        .watermark_store
        .read_or_init(self.descriptor.name, seed)
        .await?
        .water_mark;

        self.watermark_store.mark_running(self.descriptor.name).await?;
        let run_id = self.run_log.open(self.descriptor.name).await?;

        let result = self.run_inner(kind, current, effective_cap, request_id).await;

        match &result {
            Ok(outcome) => {
                self.run_log
                .close(run_id, RunOutcome::Success, outcome.rows_written as i64, None)
                .await?;
                self.metrics.record_rows_written(self.descriptor.name, outcome.rows_written);
                self.metrics.record_run_outcome(self.descriptor.name, "success");
                if let Ok(row) = self.watermark_store.read_or_init(self.descriptor.name, today_cap).await {
                    self.metrics.set_watermark(self.descriptor.name, row.water_mark.as_i32());
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.watermark_store.mark_failed(self.descriptor.name, &message).await?;
                self.run_log.close(run_id, RunOutcome::Failed, 0, Some(&message)).await?;
                self.metrics.record_run_outcome(self.descriptor.name, "failed");
            }
        }

        result
    }

    async fn run_inner(
        &self,
        kind: StageKind<'_>,
        current: TradeDate,
        ceiling: TradeDate,
        request_id: &str,
    ) -> Result<StageOutcome, StageError> {
        let run_quality_check = matches!(kind, StageKind::ByTradeDate {.. });
        match kind {
            StageKind::ByTradeDate {.. } | StageKind::ByAnnouncementDate {.. } => {
                let start = current.succ();
                let Some(range) = DateRange::new(start, ceiling) else {
                    info!(api = self.descriptor.name, "watermark already at today-cap; nothing owed");
                    return Ok(StageOutcome { api_name: self.descriptor.name.to_string(), rows_written: 0, no_op: true });
                };

                let dates = self.calendar.trading_days_between(range.start, range.end).await?;

                // Per spec.md §5: a small bounded worker pool fetches pages
                // concurrently, but `buffered` still yields them back in
                // `dates`' original order, so writes stay strictly
                // sequential and the watermark only ever advances through
                // contiguous, already-written dates.
                let concurrency = self.fetch_concurrency.max(1);
                let mut fetches = stream::iter(dates.iter().copied().map(|date| async move {
                    let outcome = self.timed_fetch(FetchParam::TradeDate(date.as_i32()), request_id).await;
                    (date, outcome)
                }))
                .buffered(concurrency);

                let mut total_rows = 0usize;
                let mut last_written = current;
                let mut failure: Option<StageError> = None;

                while let Some((date, page_result)) = fetches.next().await {
                    if self.cancellation.is_cancelled() {
                        warn!(api = self.descriptor.name, "shutdown signal received; stopping before the next page");
                        failure = Some(StageError::Cancelled { name: self.descriptor.name.to_string() });
                        break;
                    }

                    let page = match page_result {
                        Ok(page) => page,
                        Err(e) => {
                            failure = Some(StageError::from(e));
                            break;
                        }
                    };

                    match self.writer.upsert(self.descriptor.target_table, &page, self.descriptor.primary_key).await {
                        Ok(rows) => {
                            total_rows += rows;
                            last_written = date;
                        }
                        Err(e) => {
                            failure = Some(StageError::from(e));
                            break;
                        }
                    }
                }

                // Persist whatever prefix of the range actually landed
                // before surfacing the failure -- a mid-range transient
                // failure (spec.md §8 Scenario B) must not erase rows that
                // already committed.
                if last_written > current {
                    self.watermark_store
                    .advance(self.descriptor.name, last_written, ceiling)
                    .await?;

                    if run_quality_check {
                        // best-effort: a missed assertion never fails a stage that already wrote its data.
                        let _ = self
                        .quality_checker
                        .run(
                            Assertion::MinRowCount { table: self.descriptor.target_table, trade_date: last_written, minimum: 1 },
                            Severity::Warn,
                        )
                        .await;
                    }
                }

                if let Some(err) = failure {
                    return Err(err);
                }

                Ok(StageOutcome { api_name: self.descriptor.name.to_string(), rows_written: total_rows, no_op: false })
            }
            StageKind::ByEntityId { entity_codes } => {
                let concurrency = self.fetch_concurrency.max(1);
                let mut fetches = stream::iter(entity_codes.iter().cloned().map(|code| async move {
                    let outcome = self.timed_fetch(FetchParam::EntityCode(code.clone()), request_id).await;
                    (code, outcome)
                }))
                .buffered(concurrency);

                let mut total_rows = 0usize;
                while let Some((code, page_result)) = fetches.next().await {
                    if self.cancellation.is_cancelled() {
                        warn!(api = self.descriptor.name, "shutdown signal received; stopping before the next entity");
                        return Err(StageError::Cancelled { name: self.descriptor.name.to_string() });
                    }
                    let page = page_result.map_err(|e| {
                        warn!(api = self.descriptor.name, entity_code = %code, "fetch failed for entity");
                        StageError::from(e)
                    })?;
                    total_rows += self
                    .writer
                    .upsert(self.descriptor.target_table, &page, self.descriptor.primary_key)
                    .await?;
                }
                if !entity_codes.is_empty() {
                    self.watermark_store.advance(self.descriptor.name, ceiling, ceiling).await.ok();
                }
                Ok(StageOutcome { api_name: self.descriptor.name.to_string(), rows_written: total_rows, no_op: entity_codes.is_empty() })
            }
        }
    }

    /// Fetches one page, recording latency under "success"/"failure" so the
    /// histogram distinguishes healthy requests from retried-out ones.
    async fn timed_fetch(&self, param: FetchParam, request_id: &str) -> Result<crate::page::Page, FetchError> {
        let started = crate::utils::time::current_timestamp();
        let result = self
        .fetcher
        .fetch(self.descriptor, param, self.base_url, self.descriptor.schema, request_id)
        .await;
        let elapsed_ms = crate::utils::time::calculate_duration_ms(started, crate::utils::time::current_timestamp());
        let outcome = if result.is_ok() { "success" } else { "failure" };
        self.metrics.record_fetch_latency(self.descriptor.name, outcome, elapsed_ms as f64 / 1000.0);
        result
    }
}

/// Runs one transform stage: resolves the range still owed bounded by
/// both its own watermark and the watermarks of its declared
/// dependencies (invariant 5 -- layer N+1 only reads layer N once layer
/// N's watermark has reached that date), invokes the transform body, and
/// advances its own watermark on success. Same open/run/close/advance
/// skeleton as [`StageRunner`], generalized off the cursor-shaped fetch
/// loop onto an arbitrary SQL body.
pub struct TransformRunner<'a> {
    pub spec: &'a TransformSpec,
    pub pool: sqlx::PgPool,
    pub calendar: &'a TradingCalendar,
    pub watermark_store: &'a WatermarkStore,
    pub run_log: &'a RunLog,
    pub run_guard: &'a RunGuard,
    /// An explicit `--end-date` override clamping the effective ceiling
    /// below the calendar's own today-cap, same as [`StageRunner`].
    pub end_date_override: Option<TradeDate>,
}

impl<'a> TransformRunner<'a> {
    /// `dependency_watermarks` is the minimum watermark across every
    /// dependency the pipeline coordinator resolved for this stage;
    /// `full_backfill_start` seeds the watermark on a genuinely first run,
    /// exactly as for an ingest stage.
    #[instrument(skip(self, dependency_watermarks), fields(stage = self.spec.name))]
    pub async fn run(&self, dependency_watermarks: &[TradeDate], full_backfill_start: TradeDate) -> Result<StageOutcome, StageError> {
        let today_cap = self.calendar.today_cap().await?;
        let effective_cap = match self.end_date_override {
            Some(d) => today_cap.min(d),
            None => today_cap,
        };

        if self
        .run_guard
        .is_concurrently_running(self.spec.name, self.watermark_store, self.run_log)
        .await?
        {
            return Err(StageError::ConcurrentRun { api_name: self.spec.name.to_string() });
        }

        let current = self
        .watermark_store
        .read_or_init(self.spec.name, full_backfill_start.pred())
        .await?
        .water_mark;

        let readiness_cap = dependency_watermarks.iter().copied().min().unwrap_or(effective_cap).min(effective_cap);

        self.watermark_store.mark_running(self.spec.name).await?;
        let run_id = self.run_log.open(self.spec.name).await?;

        let result = self.run_inner(current, readiness_cap, effective_cap).await;

        match &result {
            Ok(outcome) => {
                self.run_log.close(run_id, RunOutcome::Success, outcome.rows_written as i64, None).await?;
            }
            Err(e) => {
                let message = e.to_string();
                self.watermark_store.mark_failed(self.spec.name, &message).await?;
                self.run_log.close(run_id, RunOutcome::Failed, 0, Some(&message)).await?;
            }
        }

        result
    }

    async fn run_inner(&self, current: TradeDate, readiness_cap: TradeDate, today_cap: TradeDate) -> Result<StageOutcome, StageError> {
        let Some(range) = DateRange::new(current.succ(), readiness_cap) else {
            info!(stage = self.spec.name, "nothing owed: dependency watermark has not advanced past current");
            return Ok(StageOutcome { api_name: self.spec.name.to_string(), rows_written: 0, no_op: true });
        };

        let rows = (self.spec.run)(self.pool.clone(), range).await?;
        self.watermark_store.advance(self.spec.name, range.end, today_cap).await?;
        Ok(StageOutcome { api_name: self.spec.name.to_string(), rows_written: rows as usize, no_op: false })
    }
}

/// Runs one check stage: a read-only pass over [`CheckSpec::assertions`]
/// for the calendar's current today-cap, logged to the quality log. Owns
/// no watermark of its own (invariant 2's read-only-check exception).
pub struct CheckRunner<'a> {
    pub spec: &'a CheckSpec,
    pub calendar: &'a TradingCalendar,
    pub run_log: &'a RunLog,
    pub quality_checker: &'a QualityChecker,
}

impl<'a> CheckRunner<'a> {
    #[instrument(skip(self), fields(stage = self.spec.name))]
    pub async fn run(&self) -> Result<StageOutcome, StageError> {
        let today_cap = self.calendar.today_cap().await?;
        let run_id = self.run_log.open(self.spec.name).await?;

        let assertions = (self.spec.assertions)(today_cap);
        let mut high_severity_failure = false;
        for (assertion, severity) in assertions {
            let result = self.quality_checker.run(assertion, severity).await?;
            if !result.passed && severity == Severity::Error {
                high_severity_failure = true;
            }
        }

        if high_severity_failure {
            self.run_log
            .close(run_id, RunOutcome::Failed, 0, Some("one or more HIGH-severity quality assertions failed"))
            .await?;
            Err(StageError::QualityGateFailed { name: self.spec.name.to_string() })
        } else {
            self.run_log.close(run_id, RunOutcome::Success, 0, None).await?;
            Ok(StageOutcome { api_name: self.spec.name.to_string(), rows_written: 0, no_op: false })
        }
    }
}

/// Picks the cursor-appropriate [`StageKind`] for a descriptor given a
/// full-backfill start date; entity enumeration is the caller's
/// responsibility since it isn't date-shaped.
pub fn resolve_kind<'a>(descriptor: &ApiDescriptor, full_backfill_start: TradeDate, entity_codes: &'a [String]) -> StageKind<'a> {
    match descriptor.cursor_kind {
        CursorKind::ByTradeDate => StageKind::ByTradeDate { full_backfill_start },
        CursorKind::ByAnnouncementDate => StageKind::ByAnnouncementDate { full_backfill_start },
        CursorKind::ByEntityId => StageKind::ByEntityId { entity_codes },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::ColumnType;
    use crate::types::Criticality;

    const TEST_SCHEMA: PageSchema = PageSchema {
        columns: &[("trade_date", ColumnType::Int), ("entity_code", ColumnType::Str)],
        tolerate_extra: true,
    };

    fn descriptor() -> ApiDescriptor {
        ApiDescriptor {
            name: "daily_quote",
            cursor_kind: CursorKind::ByTradeDate,
            rate_bucket: "default",
            page_size: 500,
            target_table: "fact_daily_quote",
            primary_key: &["trade_date", "entity_code"],
            readiness_lag_hours: 0,
            criticality: Criticality::Core,
            schema: &TEST_SCHEMA,
        }
    }

    #[test]
    fn resolve_kind_picks_entity_variant_for_entity_cursor() {
        let mut d = descriptor();
        d.cursor_kind = CursorKind::ByEntityId;
        let codes = vec!["000001.SZ".to_string()];
        match resolve_kind(&d, TradeDate::new(20240101).unwrap(), &codes) {
            StageKind::ByEntityId { entity_codes } => assert_eq!(entity_codes.len(), 1),
            _ => panic!("expected entity variant"),
        }
    }

    #[test]
    fn resolve_kind_picks_trade_date_variant() {
        let d = descriptor();
        match resolve_kind(&d, TradeDate::new(20240101).unwrap(), &[]) {
            StageKind::ByTradeDate {.. } => {}
            _ => panic!("expected trade-date variant"),
        }
    }

    #[test]
    fn cancelled_error_names_the_stage() {
        let err = StageError::Cancelled { name: "daily_quote".into() };
        assert!(err.to_string().contains("daily_quote"));
    }
}
