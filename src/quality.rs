//! Post-write assertions over a fact table: row-count sanity, null-rate
//! thresholds, and referential spot checks. Checks are advisory — a failed check is
//! logged and recorded, never a reason to roll back a write that already
//! committed.
//!
//! Version dependencies:
//! - sqlx = "0.7"
//! - tracing = "0.1"
//! - thiserror = "1.0"

use sqlx::PgPool;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::types::TradeDate;

#[derive(Debug, Error)]
pub enum QualityError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct QualityCheckResult {
    pub check_name: String,
    pub severity: Severity,
    pub passed: bool,
    pub detail: String,
}

/// One assertion against a fact table for a given trade date. `Unique`
/// covers the declared-PK sanity check the writer's idempotence
/// invariant implies.
pub enum Assertion<'a> {
    MinRowCount { table: &'a str, trade_date: TradeDate, minimum: i64 },
    NullRate { table: &'a str, column: &'a str, trade_date: TradeDate, max_fraction: f64 },
    MaxDateAtLeast { table: &'a str, date_column: &'a str, expected_minimum: TradeDate },
    JoinCoverage { left_table: &'a str, right_table: &'a str, join_column: &'a str, trade_date: TradeDate, min_fraction: f64 },
    Unique { table: &'a str, columns: &'a [&'a str] },
}

/// Builds the assertion list for a check stage given the date it's
/// checking; a plain `fn` pointer (not a closure) so [`CheckSpec`] can be
/// held as a `const` in the registry alongside the ingest and transform
/// stage tables.
pub type AssertionsFn = fn(TradeDate) -> Vec<(Assertion<'static>, Severity)>;

/// A named check stage: runs its assertions for the current run's target
/// date and writes each result to `meta_quality_check_log`. Unlike ingest
/// and transform stages it owns no watermark of its own -- per `spec.md`
/// §3 invariant 2, a read-only check run never needs one.
pub struct CheckSpec {
    pub name: &'static str,
    pub dependencies: &'static [&'static str],
    pub lenient: bool,
    pub assertions: AssertionsFn,
}

pub struct QualityChecker {
    pool: PgPool,
}

impl QualityChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, assertion: Assertion<'_>, severity: Severity) -> Result<QualityCheckResult, QualityError> {
        let result = match assertion {
            Assertion::MinRowCount { table, trade_date, minimum } => {
                let row: (i64,) = sqlx::query_as(&format!(
                    "SELECT count(*) FROM {table} WHERE trade_date = $1"
                ))
                .bind(trade_date.as_i32())
                .fetch_one(&self.pool)
                .await?;
                let passed = row.0 >= minimum;
                QualityCheckResult {
                    check_name: format!("min_row_count:{table}"),
                    severity,
                    passed,
                    detail: format!("found {} rows, expected at least {minimum}", row.0),
                }
            }
            Assertion::NullRate { table, column, trade_date, max_fraction } => {
                let row: (i64, i64) = sqlx::query_as(&format!(
                    "SELECT count(*) FILTER (WHERE {column} IS NULL), count(*) FROM {table} WHERE trade_date = $1"
                ))
                .bind(trade_date.as_i32())
                .fetch_one(&self.pool)
                .await?;
                let (nulls, total) = row;
                let fraction = if total == 0 { 0.0 } else { nulls as f64 / total as f64 };
                let passed = fraction <= max_fraction;
                QualityCheckResult {
                    check_name: format!("null_rate:{table}.{column}"),
                    severity,
                    passed,
                    detail: format!("{nulls}/{total} null ({:.2}%), threshold {:.2}%", fraction * 100.0, max_fraction * 100.0),
                }
            }
            Assertion::MaxDateAtLeast { table, date_column, expected_minimum } => {
                let row: (Option<i32>,) = sqlx::query_as(&format!(
                    "SELECT max({date_column}) FROM {table}"
                ))
                .fetch_one(&self.pool)
                .await?;
                let max_date = row.0.unwrap_or(0);
                let passed = max_date >= expected_minimum.as_i32();
                QualityCheckResult {
                    check_name: format!("max_date:{table}.{date_column}"),
                    severity,
                    passed,
                    detail: format!("max({date_column}) = {max_date}, expected at least {expected_minimum}"),
                }
            }
            Assertion::JoinCoverage { left_table, right_table, join_column, trade_date, min_fraction } => {
                let row: (i64, i64) = sqlx::query_as(&format!(
                    "SELECT count(*), count(*) FILTER (WHERE r.{join_column} IS NOT NULL)
                     FROM {left_table} l LEFT JOIN {right_table} r
                     ON l.{join_column} = r.{join_column} AND r.trade_date = $1
                     WHERE l.trade_date = $1"
                ))
                .bind(trade_date.as_i32())
                .fetch_one(&self.pool)
                .await?;
                let (total, matched) = row;
                let fraction = if total == 0 { 1.0 } else { matched as f64 / total as f64 };
                let passed = fraction >= min_fraction;
                QualityCheckResult {
                    check_name: format!("join_coverage:{left_table}->{right_table}"),
                    severity,
                    passed,
                    detail: format!("{matched}/{total} joined ({:.2}%), threshold {:.2}%", fraction * 100.0, min_fraction * 100.0),
                }
            }
            Assertion::Unique { table, columns } => {
                let col_list = columns.join(", ");
                let row: (i64,) = sqlx::query_as(&format!(
                    "SELECT count(*) FROM (SELECT {col_list}, count(*) c FROM {table} GROUP BY {col_list} HAVING count(*) > 1) dup"
                ))
                .fetch_one(&self.pool)
                .await?;
                let passed = row.0 == 0;
                QualityCheckResult {
                    check_name: format!("unique:{table}({col_list})"),
                    severity,
                    passed,
                    detail: format!("{} duplicate key group(s)", row.0),
                }
            }
        };

        if !result.passed {
            warn!(check = result.check_name, detail = result.detail, "quality check failed");
        }

        sqlx::query!(
            r#"INSERT INTO meta_quality_check_log (check_name, passed, severity, detail, checked_at)
 VALUES ($1, $2, $3, $4, now())"#,
            result.check_name,
            result.passed,
            match result.severity { Severity::Warn => "WARN", Severity::Error => "ERROR" },
            result.detail,
        )
        .execute(&self.pool)
        .await?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_rate_with_zero_rows_is_never_a_failure() {
        let total = 0i64;
        let nulls = 0i64;
        let fraction = if total == 0 { 0.0 } else { nulls as f64 / total as f64 };
        assert_eq!(fraction, 0.0);
    }

    #[test]
    fn join_coverage_with_zero_rows_is_never_a_failure() {
        let total = 0i64;
        let matched = 0i64;
        let fraction = if total == 0 { 1.0 } else { matched as f64 / total as f64 };
        assert_eq!(fraction, 1.0);
    }
}
