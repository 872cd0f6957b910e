//! Pluggable transform stage bodies: read a lower warehouse layer over a
//! date range, write a cleansed/feature layer on top of it. The specific
//! scoring/standardization formulas are a collaborator concern (see
//! `spec.md` §1); what lives here are representative, wired-up
//! implementations so the pipeline has something real to run end to end.
//!
//! Version dependencies:
//! - sqlx = "0.7"
//! - futures = "0.3"
//! - thiserror = "1.0"

use futures::future::BoxFuture;
use sqlx::PgPool;
use thiserror::Error;

use crate::types::DateRange;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A transform stage body: given the store and the date range it owns for
/// this invocation, writes its output and reports how many rows it
/// touched. Boxed so `TransformSpec` can hold it as a plain `fn` pointer
/// without threading a generic through the registry.
pub type TransformFn = fn(PgPool, DateRange) -> BoxFuture<'static, Result<i64, TransformError>>;

/// A named transform stage: its own watermark key, the upstream stage
/// names its input range is bounded by (read by the pipeline coordinator
/// as a readiness check, invariant 5), and whether its failure is
/// lenient.
pub struct TransformSpec {
    pub name: &'static str,
    pub dependencies: &'static [&'static str],
    pub lenient: bool,
    pub run: TransformFn,
}

/// Cleanses raw daily quotes into the standardized layer: flags
/// zero-volume rows as suspended rather than dropping them, so downstream
/// feature computation can filter consistently.
pub fn standardize_market_data(pool: PgPool, range: DateRange) -> BoxFuture<'static, Result<i64, TransformError>> {
    Box::pin(async move {
        let result = sqlx::query!(
            r#"INSERT INTO fact_standardized_quote (trade_date, entity_code, close, is_suspended, updated_at)
               SELECT trade_date, entity_code, close, (volume IS NULL OR volume = 0) AS is_suspended, now()
               FROM fact_daily_quote
               WHERE trade_date BETWEEN $1 AND $2
               ON CONFLICT (trade_date, entity_code) DO UPDATE
               SET close = EXCLUDED.close, is_suspended = EXCLUDED.is_suspended, updated_at = now()"#,
            range.start.as_i32(),
            range.end.as_i32(),
        )
        .execute(&pool)
        .await?;
        Ok(result.rows_affected() as i64)
    })
}

/// Joins the standardized layer against valuation data to derive a
/// composite score, skipping suspended entities. A point-in-time join
/// would additionally bound the valuation side by announcement date; the
/// valuation feed here is already trade-date keyed so no PIT filter
/// applies.
pub fn compute_features(pool: PgPool, range: DateRange) -> BoxFuture<'static, Result<i64, TransformError>> {
    Box::pin(async move {
        let result = sqlx::query!(
            r#"INSERT INTO fact_feature_daily (trade_date, entity_code, valuation_score, updated_at)
               SELECT s.trade_date, s.entity_code,
                      CASE WHEN v.pe_ratio IS NULL OR v.pe_ratio <= 0 THEN NULL ELSE 1.0 / v.pe_ratio END,
                      now()
               FROM fact_standardized_quote s
               LEFT JOIN fact_daily_valuation v
                 ON v.trade_date = s.trade_date AND v.entity_code = s.entity_code
               WHERE s.trade_date BETWEEN $1 AND $2 AND NOT s.is_suspended
               ON CONFLICT (trade_date, entity_code) DO UPDATE
               SET valuation_score = EXCLUDED.valuation_score, updated_at = now()"#,
            range.start.as_i32(),
            range.end.as_i32(),
        )
        .execute(&pool)
        .await?;
        Ok(result.rows_affected() as i64)
    })
}

/// Re-derives the feature layer for dates where a margin or late-arriving
/// financial-enhancement feed has just landed, by re-running
/// [`compute_features`] over the same range. Kept as a distinct named
/// stage (rather than reusing `compute_features` directly) so the evening
/// and T+1 pipelines each get their own watermark/run-log trail.
pub fn recompute_features_for_late_data(pool: PgPool, range: DateRange) -> BoxFuture<'static, Result<i64, TransformError>> {
    compute_features(pool, range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeDate;

    #[test]
    fn transform_fn_pointers_are_plain_fn_not_closures() {
        // Guards against accidentally turning these into non-`fn` closures,
        // which would break `TransformSpec` being usable as a `const`.
        let _: TransformFn = standardize_market_data;
        let _: TransformFn = compute_features;
        let _: TransformFn = recompute_features_for_late_data;
    }

    #[test]
    fn date_range_passed_to_a_transform_is_inclusive() {
        let range = DateRange::new(TradeDate::new(20240110).unwrap(), TradeDate::new(20240111).unwrap()).unwrap();
        assert_eq!(range.start.as_i32(), 20240110);
        assert_eq!(range.end.as_i32(), 20240111);
    }
}
