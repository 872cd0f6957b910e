//! Static registry of known upstream APIs, the transform/check stages
//! built on top of them, and the named pipelines composed from both.
//! Constructed once at process startup and never mutated; this is the one
//! place a new upstream endpoint or derived layer gets wired in.
//!
//! Version dependencies: none beyond what `types.rs`, `transform.rs`,
//! `quality.rs` and `pipeline.rs` use.

use crate::page::{ColumnType, PageSchema};
use crate::pipeline::{FailurePolicy, StageNode};
use crate::quality::{Assertion, CheckSpec, Severity};
use crate::transform::{compute_features, recompute_features_for_late_data, standardize_market_data, TransformSpec};
use crate::types::{ApiDescriptor, Criticality, CursorKind, TradeDate};

/// Per-API page shapes. An upstream response carrying a column outside
/// its declared set is column drift (`spec.md` §6) and fails the fetch
/// before the page ever reaches the writer; see `page.rs::SchemaError`.
pub const DAILY_QUOTE_SCHEMA: PageSchema = PageSchema {
    columns: &[
        ("trade_date", ColumnType::Int),
        ("entity_code", ColumnType::Str),
        ("open", ColumnType::Decimal),
        ("high", ColumnType::Decimal),
        ("low", ColumnType::Decimal),
        ("close", ColumnType::Decimal),
        ("volume", ColumnType::Int),
    ],
    tolerate_extra: false,
};

pub const DAILY_VALUATION_SCHEMA: PageSchema = PageSchema {
    columns: &[
        ("trade_date", ColumnType::Int),
        ("entity_code", ColumnType::Str),
        ("pe_ratio", ColumnType::Decimal),
        ("pb_ratio", ColumnType::Decimal),
        ("turnover_pct", ColumnType::Decimal),
    ],
    tolerate_extra: false,
};

pub const COMPANY_ANNOUNCEMENT_SCHEMA: PageSchema = PageSchema {
    columns: &[
        ("announcement_date", ColumnType::Int),
        ("entity_code", ColumnType::Str),
        ("announcement_id", ColumnType::Str),
        ("title", ColumnType::Str),
    ],
    tolerate_extra: false,
};

pub const ENTITY_REFERENCE_SCHEMA: PageSchema = PageSchema {
    columns: &[("entity_code", ColumnType::Str), ("entity_name", ColumnType::Str)],
    tolerate_extra: false,
};

pub const MARGIN_DATA_SCHEMA: PageSchema = PageSchema {
    columns: &[
        ("trade_date", ColumnType::Int),
        ("entity_code", ColumnType::Str),
        ("margin_balance", ColumnType::Decimal),
        ("short_balance", ColumnType::Decimal),
    ],
    tolerate_extra: false,
};

pub const DIVIDEND_FINANCIAL_SCHEMA: PageSchema = PageSchema {
    columns: &[
        ("announcement_date", ColumnType::Int),
        ("entity_code", ColumnType::Str),
        ("dividend_per_share", ColumnType::Decimal),
        ("eps", ColumnType::Decimal),
    ],
    tolerate_extra: false,
};

pub const DAILY_QUOTE: ApiDescriptor = ApiDescriptor {
    name: "daily_quote",
    cursor_kind: CursorKind::ByTradeDate,
    rate_bucket: "quote_api",
    page_size: 500,
    target_table: "fact_daily_quote",
    primary_key: &["trade_date", "entity_code"],
    readiness_lag_hours: 0,
    criticality: Criticality::Core,
    schema: &DAILY_QUOTE_SCHEMA,
};

pub const DAILY_VALUATION: ApiDescriptor = ApiDescriptor {
    name: "daily_valuation",
    cursor_kind: CursorKind::ByTradeDate,
    rate_bucket: "quote_api",
    page_size: 500,
    target_table: "fact_daily_valuation",
    primary_key: &["trade_date", "entity_code"],
    readiness_lag_hours: 20,
    criticality: Criticality::Feature,
    schema: &DAILY_VALUATION_SCHEMA,
};

pub const COMPANY_ANNOUNCEMENT: ApiDescriptor = ApiDescriptor {
    name: "company_announcement",
    cursor_kind: CursorKind::ByAnnouncementDate,
    rate_bucket: "announcement_api",
    page_size: 200,
    target_table: "fact_company_announcement",
    primary_key: &["announcement_date", "entity_code", "announcement_id"],
    readiness_lag_hours: 0,
    criticality: Criticality::Feature,
    schema: &COMPANY_ANNOUNCEMENT_SCHEMA,
};

pub const ENTITY_REFERENCE: ApiDescriptor = ApiDescriptor {
    name: "entity_reference",
    cursor_kind: CursorKind::ByEntityId,
    rate_bucket: "reference_api",
    page_size: 1000,
    target_table: "dim_entity",
    primary_key: &["entity_code"],
    readiness_lag_hours: 0,
    criticality: Criticality::Core,
    schema: &ENTITY_REFERENCE_SCHEMA,
};

/// Late-arriving margin/short-selling data, only settled and published by
/// the exchange the trading day after it happened (the "T+1 morning
/// pipeline" of `spec.md` §4.8).
pub const MARGIN_DATA: ApiDescriptor = ApiDescriptor {
    name: "margin_data",
    cursor_kind: CursorKind::ByTradeDate,
    rate_bucket: "margin_api",
    page_size: 500,
    target_table: "fact_margin_data",
    primary_key: &["trade_date", "entity_code"],
    readiness_lag_hours: 0,
    criticality: Criticality::Feature,
    schema: &MARGIN_DATA_SCHEMA,
};

/// The evening financial-enhancement feed: dividend/financial data that
/// only becomes available after the 20:00 vendor batch.
pub const DIVIDEND_FINANCIAL: ApiDescriptor = ApiDescriptor {
    name: "dividend_financial",
    cursor_kind: CursorKind::ByAnnouncementDate,
    rate_bucket: "announcement_api",
    page_size: 200,
    target_table: "fact_dividend_financial",
    primary_key: &["announcement_date", "entity_code"],
    readiness_lag_hours: 20,
    criticality: Criticality::Feature,
    schema: &DIVIDEND_FINANCIAL_SCHEMA,
};

pub fn all_descriptors() -> Vec<&'static ApiDescriptor> {
    vec![
        &DAILY_QUOTE,
        &DAILY_VALUATION,
        &COMPANY_ANNOUNCEMENT,
        &ENTITY_REFERENCE,
        &MARGIN_DATA,
        &DIVIDEND_FINANCIAL,
    ]
}

pub fn find_descriptor(name: &str) -> Option<&'static ApiDescriptor> {
    all_descriptors().into_iter().find(|d| d.name == name)
}

/// Cleanses `daily_quote` into the standardized layer. Runs after the
/// afternoon core pipeline's ingest stage.
pub const STANDARDIZE_MARKET_DATA: TransformSpec = TransformSpec {
    name: "standardize_market_data",
    dependencies: &["daily_quote"],
    lenient: false,
    run: standardize_market_data,
};

/// Joins the standardized layer against valuation data into the feature
/// layer the afternoon core pipeline publishes.
pub const COMPUTE_FEATURES: TransformSpec = TransformSpec {
    name: "compute_features",
    dependencies: &["standardize_market_data", "daily_valuation"],
    lenient: false,
    run: compute_features,
};

/// Re-derives the feature layer once the evening dividend/financial feed
/// has landed. A distinct stage name (and watermark) from
/// `compute_features` so the evening pipeline's re-run is independently
/// tracked and retryable.
pub const RECOMPUTE_FEATURES_EVENING: TransformSpec = TransformSpec {
    name: "recompute_features_evening",
    dependencies: &["dividend_financial", "compute_features"],
    lenient: true,
    run: recompute_features_for_late_data,
};

/// Re-derives the feature layer once T+1 margin data has landed.
pub const RECOMPUTE_FEATURES_T1: TransformSpec = TransformSpec {
    name: "recompute_features_t1",
    dependencies: &["margin_data", "compute_features"],
    lenient: true,
    run: recompute_features_for_late_data,
};

fn daily_feature_quality_assertions(date: TradeDate) -> Vec<(Assertion<'static>, Severity)> {
    vec![
        (
            Assertion::MinRowCount { table: "fact_feature_daily", trade_date: date, minimum: 1 },
            Severity::Error,
        ),
        (
            Assertion::NullRate {
                table: "fact_feature_daily",
                column: "valuation_score",
                trade_date: date,
                max_fraction: 0.5,
            },
            Severity::Warn,
        ),
        (
            Assertion::Unique { table: "fact_feature_daily", columns: &["trade_date", "entity_code"] },
            Severity::Error,
        ),
    ]
}

/// Post-stage freshness/row-count/uniqueness gate on the published
/// feature layer. A HIGH-severity (`Severity::Error`) failure converts to
/// a stage failure under strict policy (`spec.md` §7, error kind 6).
pub const QUALITY_GATE_DAILY: CheckSpec = CheckSpec {
    name: "quality_gate_daily",
    dependencies: &["compute_features"],
    lenient: false,
    assertions: daily_feature_quality_assertions,
};

/// The fixed stage order and failure policy for each named pipeline.
/// `spec.md` §4.8 names three canonical pipelines as a contract, not a
/// closed enumeration -- `reference_only` is this crate's own bootstrap
/// utility pipeline, not one of the three.
pub fn pipeline_stages(name: &str) -> Option<(Vec<StageNode>, FailurePolicy)> {
    match name {
        // Ingests the day's basic market data, standardizes it, and
        // computes the published feature layer, gated by a quality check.
        "afternoon_core" => Some((
            vec![
                StageNode::Ingest(&ENTITY_REFERENCE),
                StageNode::Ingest(&DAILY_QUOTE),
                StageNode::Ingest(&DAILY_VALUATION),
                StageNode::Transform(&STANDARDIZE_MARKET_DATA),
                StageNode::Transform(&COMPUTE_FEATURES),
                StageNode::Check(&QUALITY_GATE_DAILY),
            ],
            FailurePolicy::Strict,
        )),
        // Ingests the evening dividend/financial enhancement feed and
        // re-runs the dependent feature transform; lenient by default
        // since the whole point is tolerating today's enhancement not
        // being ready yet.
        "evening_enhancement" => Some((
            vec![
                StageNode::Ingest(&DIVIDEND_FINANCIAL),
                StageNode::Ingest(&COMPANY_ANNOUNCEMENT),
                StageNode::Transform(&RECOMPUTE_FEATURES_EVENING),
            ],
            FailurePolicy::Lenient,
        )),
        // T+1 morning pipeline: ingests margin data settled overnight and
        // re-runs the downstream feature transform.
        "t1_morning" => Some((
            vec![StageNode::Ingest(&MARGIN_DATA), StageNode::Transform(&RECOMPUTE_FEATURES_T1)],
            FailurePolicy::Lenient,
        )),
        "reference_only" => Some((vec![StageNode::Ingest(&ENTITY_REFERENCE)], FailurePolicy::Strict)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_descriptor_is_case_sensitive_and_total() {
        assert!(find_descriptor("daily_quote").is_some());
        assert!(find_descriptor("does_not_exist").is_none());
    }

    #[test]
    fn afternoon_core_runs_reference_data_before_facts() {
        let (stages, _) = pipeline_stages("afternoon_core").unwrap();
        assert_eq!(stages[0].name(), "entity_reference");
    }

    #[test]
    fn afternoon_core_ends_with_a_quality_gate() {
        let (stages, _) = pipeline_stages("afternoon_core").unwrap();
        assert_eq!(stages.last().unwrap().name(), "quality_gate_daily");
    }

    #[test]
    fn evening_and_t1_pipelines_are_lenient_by_default() {
        let (_, evening_policy) = pipeline_stages("evening_enhancement").unwrap();
        let (_, t1_policy) = pipeline_stages("t1_morning").unwrap();
        assert_eq!(evening_policy, FailurePolicy::Lenient);
        assert_eq!(t1_policy, FailurePolicy::Lenient);
    }

    #[test]
    fn unknown_pipeline_name_resolves_to_none() {
        assert!(pipeline_stages("does_not_exist").is_none());
    }
}
