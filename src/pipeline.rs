//! Named pipelines: an ordered list of stages run together under one
//! pipeline-level failure policy, refined per-stage by each stage's own
//! criticality/lenience. Strict pipelines abort on the first
//! Core-criticality stage failure; lenient pipelines run every stage and
//! report partial success, as long as today's own data isn't being
//! demanded before its readiness lag has elapsed and a stage's declared
//! dependencies have actually caught up (invariant 5).
//!
//! Version dependencies:
//! - tokio = "1.28"
//! - tracing = "0.1"
//! - thiserror = "1.0"
//! - chrono = "0.4"

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::calendar::wall_clock_today;
use crate::context::RuntimeContext;
use crate::quality::CheckSpec;
use crate::stage::{resolve_kind, CheckRunner, StageError, StageOutcome, StageRunner, TransformRunner};
use crate::transform::TransformSpec;
use crate::types::{ApiDescriptor, Criticality, TradeDate};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("required stage {api_name} failed: {source}")]
    RequiredStageFailed { api_name: String, source: StageError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the whole pipeline the moment a Core-criticality stage fails.
    Strict,
    /// Run every stage regardless of prior failures; only Core-stage
    /// failures are reported, Feature-stage failures are logged and
    /// skipped.
    Lenient,
}

/// One node in a pipeline's declared stage list. A pipeline mixes all
/// three kinds in one ordered sequence -- e.g. ingest raw quotes, then
/// transform them into the standardized layer, then check the result --
/// matching `spec.md` §3's `Stage Definition { kind ∈ {ingest, transform,
/// check}, ... }`.
#[derive(Clone, Copy)]
pub enum StageNode {
    Ingest(&'static ApiDescriptor),
    Transform(&'static TransformSpec),
    Check(&'static CheckSpec),
}

impl StageNode {
    pub fn name(&self) -> &'static str {
        match self {
            StageNode::Ingest(d) => d.name,
            StageNode::Transform(t) => t.name,
            StageNode::Check(c) => c.name,
        }
    }

    /// Names of the upstream stages this node's input range is bounded
    /// by. Empty for ingest stages, which read from the upstream vendor
    /// rather than a lower warehouse layer.
    pub fn dependencies(&self) -> &'static [&'static str] {
        match self {
            StageNode::Ingest(_) => &[],
            StageNode::Transform(t) => t.dependencies,
            StageNode::Check(c) => c.dependencies,
        }
    }

    /// Whether this node's own failure is downgraded to a warning
    /// regardless of the pipeline's overall policy (`spec.md` §3's
    /// per-stage "lenience flag"). Ingest stages reuse their
    /// `ApiDescriptor::criticality` for this; transform/check stages carry
    /// an explicit flag since they have no criticality field of their own.
    pub fn lenient(&self) -> bool {
        match self {
            StageNode::Ingest(d) => d.criticality == Criticality::Feature,
            StageNode::Transform(t) => t.lenient,
            StageNode::Check(c) => c.lenient,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub api_name: String,
    pub criticality: Criticality,
    pub outcome: Result<StageOutcome, String>,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub name: String,
    pub results: Vec<StageResult>,
}

impl PipelineReport {
    pub fn failed_core_stages(&self) -> Vec<&StageResult> {
        self.results
        .iter()
        .filter(|r| r.criticality == Criticality::Core && r.outcome.is_err())
        .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed_core_stages().is_empty()
    }
}

pub struct PipelineDefinition<'a> {
    pub name: &'a str,
    pub policy: FailurePolicy,
    pub stages: Vec<StageNode>,
    pub full_backfill_start: TradeDate,
    /// An explicit `--end-date` override (`spec.md` §4.5): clamps the
    /// effective ceiling a stage fetches up to, on top of the calendar's
    /// own today-cap. `None` means today-cap alone governs the range.
    pub end_date_override: Option<TradeDate>,
}

pub struct PipelineCoordinator;

impl PipelineCoordinator {
    /// Runs every stage in `definition` in declared order, dispatching
    /// each [`StageNode`] to the runner its kind needs. Between stages,
    /// performs the readiness check of `spec.md` §4.8: a stage whose
    /// declared dependencies haven't all reached a watermark is either
    /// skipped (stage-lenient) or the pipeline aborts (otherwise).
    /// Returns as soon as a Core-criticality stage fails under
    /// [`FailurePolicy::Strict`]; otherwise runs the full list.
    #[instrument(skip(ctx, definition), fields(pipeline = definition.name))]
    pub async fn run(
        ctx: &RuntimeContext,
        base_url: &str,
        definition: &PipelineDefinition<'_>,
        request_id: &str,
    ) -> PipelineReport {
        let mut results = Vec::with_capacity(definition.stages.len());

        for node in &definition.stages {
            if ctx.shutdown.is_cancelled() {
                info!(pipeline = definition.name, stage = node.name(), "shutdown signal received; stopping before next stage");
                break;
            }

            let node_lenient = effective_lenient(node.lenient(), definition.policy);

            let mut dependency_watermarks = Vec::with_capacity(node.dependencies().len());
            let mut deps_ready = true;
            for dep in node.dependencies() {
                match ctx.watermark_store.try_read(dep).await {
                    Ok(Some(row)) => dependency_watermarks.push(row.water_mark),
                    Ok(None) => deps_ready = false,
                    Err(e) => {
                        warn!(stage = node.name(), dependency = *dep, error = %e, "failed to read dependency watermark");
                        deps_ready = false;
                    }
                }
            }

            if !deps_ready {
                if node_lenient {
                    info!(stage = node.name(), "skipping stage: a dependency watermark is not yet available");
                    continue;
                }
                warn!(pipeline = definition.name, stage = node.name(), "aborting pipeline: dependency readiness check failed");
                break;
            }

            if let StageNode::Ingest(descriptor) = node {
                if !stage_is_ready(descriptor) {
                    info!(api = descriptor.name, "skipping stage: today's data not yet within readiness lag");
                    continue;
                }
            }

            let outcome = match node {
                StageNode::Ingest(descriptor) => {
                    let runner = StageRunner {
                        descriptor,
                        base_url,
                        calendar: &ctx.calendar,
                        watermark_store: &ctx.watermark_store,
                        run_log: &ctx.run_log,
                        run_guard: &ctx.run_guard,
                        fetcher: &ctx.fetcher,
                        writer: &ctx.writer,
                        metrics: &ctx.metrics,
                        quality_checker: &ctx.quality_checker,
                        cancellation: &ctx.shutdown,
                        fetch_concurrency: ctx.fetch_concurrency,
                        end_date_override: definition.end_date_override,
                    };
                    let kind = resolve_kind(descriptor, definition.full_backfill_start, &[]);
                    runner.run(kind, request_id).await
                }
                StageNode::Transform(spec) => {
                    let runner = TransformRunner {
                        spec,
                        pool: ctx.pool.clone(),
                        calendar: &ctx.calendar,
                        watermark_store: &ctx.watermark_store,
                        run_log: &ctx.run_log,
                        run_guard: &ctx.run_guard,
                        end_date_override: definition.end_date_override,
                    };
                    runner.run(&dependency_watermarks, definition.full_backfill_start).await
                }
                StageNode::Check(spec) => {
                    let runner = CheckRunner {
                        spec,
                        calendar: &ctx.calendar,
                        run_log: &ctx.run_log,
                        quality_checker: &ctx.quality_checker,
                    };
                    runner.run().await
                }
            };

            let criticality = if node_lenient { Criticality::Feature } else { Criticality::Core };
            let failed_required = outcome.is_err() && criticality == Criticality::Core;

            results.push(StageResult {
                    api_name: node.name().to_string(),
                    criticality,
                    outcome: outcome.map_err(|e| e.to_string()),
            });

            if failed_required && definition.policy == FailurePolicy::Strict {
                warn!(
                    pipeline = definition.name,
                    stage = node.name(),
                    "aborting pipeline: required stage failed under strict policy"
                );
                break;
            }
        }

        PipelineReport { name: definition.name.to_string(), results }
    }
}

/// Whether a stage's failure is downgraded to a warning: either the stage
/// is lenient on its own terms (`StageNode::lenient`), or the whole
/// pipeline is running under a `--lenient` override (`spec.md` §6's
/// `pipeline.<name>.lenient` config/CLI override), which downgrades every
/// stage regardless of its own declared criticality -- a pipeline-wide
/// lenient run has no strict stages left, so it can never fail the exit
/// code on a Core stage's error.
fn effective_lenient(node_declared_lenient: bool, policy: FailurePolicy) -> bool {
    node_declared_lenient || policy == FailurePolicy::Lenient
}

/// An API's data for "today" is only fetchable once `readiness_lag_hours`
/// have elapsed since local midnight. Backfill ranges that don't touch today are unaffected --
/// this only gates whether today itself is included, which the stage
/// runner naturally handles by simply not finding today within
/// `today_cap` yet.
fn stage_is_ready(descriptor: &ApiDescriptor) -> bool {
    if descriptor.readiness_lag_hours == 0 {
        return true;
    }
    let today = wall_clock_today();
    let now = Utc::now();
    let midnight = today
    .to_naive_date()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .expect("wall_clock_today always yields a valid date");
    let elapsed_hours = (now.naive_utc() - midnight).num_hours();
    elapsed_hours >= descriptor.readiness_lag_hours as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageSchema;

    const TEST_SCHEMA: PageSchema = PageSchema { columns: &[], tolerate_extra: true };

    #[test]
    fn readiness_lag_of_zero_is_always_ready() {
        let descriptor = ApiDescriptor {
            name: "x",
            cursor_kind: crate::types::CursorKind::ByTradeDate,
            rate_bucket: "default",
            page_size: 1,
            target_table: "t",
            primary_key: &["id"],
            readiness_lag_hours: 0,
            criticality: Criticality::Core,
            schema: &TEST_SCHEMA,
        };
        assert!(stage_is_ready(&descriptor));
    }

    #[test]
    fn pipeline_report_success_ignores_feature_failures() {
        let report = PipelineReport {
            name: "nightly".into(),
            results: vec![StageResult {
                    api_name: "optional_feed".into(),
                    criticality: Criticality::Feature,
                    outcome: Err("upstream down".into()),
            }],
        };
        assert!(report.is_success());
    }

    #[test]
    fn pipeline_report_failure_on_core_stage_error() {
        let report = PipelineReport {
            name: "nightly".into(),
            results: vec![StageResult {
                    api_name: "daily_quote".into(),
                    criticality: Criticality::Core,
                    outcome: Err("upstream down".into()),
            }],
        };
        assert!(!report.is_success());
        assert_eq!(report.failed_core_stages().len(), 1);
    }

    #[test]
    fn pipeline_wide_lenient_override_downgrades_a_strict_core_stage() {
        // A Core-criticality stage, declared strict on its own
        // (`node.lenient() == false`), but the pipeline is run under a
        // `--lenient` override. The effective lenience must follow the
        // override, not the stage's own declared criticality.
        assert!(effective_lenient(false, FailurePolicy::Lenient));
    }

    #[test]
    fn strict_pipeline_leaves_a_strict_stage_strict() {
        assert!(!effective_lenient(false, FailurePolicy::Strict));
    }

    #[test]
    fn a_stage_declared_lenient_stays_lenient_under_strict_policy() {
        assert!(effective_lenient(true, FailurePolicy::Strict));
    }

    #[test]
    fn lenient_override_makes_a_core_stage_failure_not_fail_the_pipeline() {
        // Mirrors what `PipelineCoordinator::run` does with a Core
        // descriptor under `FailurePolicy::Lenient`: criticality recorded
        // on the `StageResult` follows the effective lenience, not the raw
        // `ApiDescriptor::criticality`, so `is_success()` stays true and
        // the process exits 0 per spec.md §6.
        let node_lenient = effective_lenient(false, FailurePolicy::Lenient);
        let criticality = if node_lenient { Criticality::Feature } else { Criticality::Core };
        let report = PipelineReport {
            name: "evening_enhancement".into(),
            results: vec![StageResult {
                    api_name: "dividend_financial".into(),
                    criticality,
                    outcome: Err("upstream down".into()),
            }],
        };
        assert!(report.is_success());
        assert!(report.failed_core_stages().is_empty());
    }

    #[test]
    fn stage_node_dependencies_are_empty_for_ingest() {
        let descriptor = ApiDescriptor {
            name: "x",
            cursor_kind: crate::types::CursorKind::ByTradeDate,
            rate_bucket: "default",
            page_size: 1,
            target_table: "t",
            primary_key: &["id"],
            readiness_lag_hours: 0,
            criticality: Criticality::Core,
            schema: &TEST_SCHEMA,
        };
        assert!(StageNode::Ingest(&descriptor).dependencies().is_empty());
    }
}
