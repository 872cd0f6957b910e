//! Persistent per-API cursor + status, with monotonic advancement rules
//! that forbid the watermark from ever running ahead of the trading
//! calendar's today-cap.
//!
//! Version dependencies:
//! - sqlx = "0.7"
//! - chrono = "0.4"
//! - tracing = "0.1"
//! - thiserror = "1.0"

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::instrument;

use crate::types::TradeDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct WatermarkRow {
    pub api_name: String,
    pub water_mark: TradeDate,
    pub status: RunStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("refusing to advance {api_name} watermark to {attempted}: exceeds today-cap {cap}")]
    ExceedsTodayCap {
        api_name: String,
        attempted: TradeDate,
        cap: TradeDate,
    },
    #[error("refusing to advance {api_name} watermark: new value {new_value} is not greater than current {current}")]
    NotMonotonic {
        api_name: String,
        new_value: TradeDate,
        current: TradeDate,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct WatermarkStore {
    pool: PgPool,
}

impl WatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Reads the current watermark, lazily creating it at `start_date -
    /// 1 trading day` if this is the API's first run.
    #[instrument(skip(self))]
    pub async fn read_or_init(
        &self,
        api_name: &str,
        initial_value: TradeDate,
    ) -> Result<WatermarkRow, WatermarkError> {
        if let Some(row) = sqlx::query_as!(
            RawWatermarkRow,
            r#"SELECT api_name, water_mark, status as "status: RunStatus", last_run_at, last_err
               FROM meta_etl_watermark WHERE api_name = $1"#,
            api_name
        )
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(row.into());
        }

        sqlx::query!(
            r#"INSERT INTO meta_etl_watermark (api_name, water_mark, status, last_run_at, last_err, updated_at)
               VALUES ($1, $2, 'SUCCESS', NULL, NULL, now())
               ON CONFLICT (api_name) DO NOTHING"#,
            api_name,
            initial_value.as_i32(),
        )
        .execute(&self.pool)
        .await?;

        Ok(WatermarkRow {
            api_name: api_name.to_string(),
            water_mark: initial_value,
            status: RunStatus::Success,
            last_run_at: None,
            last_error: None,
        })
    }

    /// Reads the watermark without lazily creating it. Used where a caller
    /// only needs to inspect a status that may not exist yet and must not
    /// race the real `read_or_init(api_name, correct_start_date)` call with
    /// one seeded by an arbitrary placeholder.
    #[instrument(skip(self))]
    pub async fn try_read(&self, api_name: &str) -> Result<Option<WatermarkRow>, WatermarkError> {
        let row = sqlx::query_as!(
            RawWatermarkRow,
            r#"SELECT api_name, water_mark, status as "status: RunStatus", last_run_at, last_err
               FROM meta_etl_watermark WHERE api_name = $1"#,
            api_name
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Advances the watermark. Requires `new_value > current` and refuses
    /// any value greater than `today_cap` — the documented fix for the
    /// "watermark runs into the future" defect.
    #[instrument(skip(self))]
    pub async fn advance(
        &self,
        api_name: &str,
        new_value: TradeDate,
        today_cap: TradeDate,
    ) -> Result<(), WatermarkError> {
        if new_value > today_cap {
            return Err(WatermarkError::ExceedsTodayCap {
                api_name: api_name.to_string(),
                attempted: new_value,
                cap: today_cap,
            });
        }

        let current = self.read_or_init(api_name, new_value).await?.water_mark;
        if new_value <= current {
            return Err(WatermarkError::NotMonotonic {
                api_name: api_name.to_string(),
                new_value,
                current,
            });
        }

        sqlx::query!(
            r#"UPDATE meta_etl_watermark
               SET water_mark = $2, status = 'SUCCESS', last_run_at = now(), last_err = NULL, updated_at = now()
               WHERE api_name = $1"#,
            api_name,
            new_value.as_i32(),
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn mark_running(&self, api_name: &str) -> Result<(), WatermarkError> {
        sqlx::query!(
            r#"UPDATE meta_etl_watermark SET status = 'RUNNING', last_run_at = now(), updated_at = now()
               WHERE api_name = $1"#,
            api_name
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// On FAILED the watermark value itself is unchanged. Only status/error are updated.
    #[instrument(skip(self))]
    pub async fn mark_failed(&self, api_name: &str, error: &str) -> Result<(), WatermarkError> {
        let truncated: String = error.chars().take(2_000).collect();
        sqlx::query!(
            r#"UPDATE meta_etl_watermark SET status = 'FAILED', last_err = $2, updated_at = now()
               WHERE api_name = $1"#,
            api_name,
            truncated,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

struct RawWatermarkRow {
    api_name: String,
    water_mark: i32,
    status: RunStatus,
    last_run_at: Option<DateTime<Utc>>,
    last_err: Option<String>,
}

impl From<RawWatermarkRow> for WatermarkRow {
    fn from(r: RawWatermarkRow) -> Self {
        WatermarkRow {
            api_name: r.api_name,
            water_mark: TradeDate::new(r.water_mark).expect("stored watermark is always a valid TradeDate"),
            status: r.status,
            last_run_at: r.last_run_at,
            last_error: r.last_err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceeds_today_cap_is_reported_with_both_values() {
        let err = WatermarkError::ExceedsTodayCap {
            api_name: "daily".into(),
            attempted: TradeDate::new(20251231).unwrap(),
            cap: TradeDate::new(20240115).unwrap(),
        };
        let msg = err.to_string();
        assert!(msg.contains("20251231"));
        assert!(msg.contains("20240115"));
    }
}
