//! Retry-guard idempotency store and the zombie-watermark reconciliation
//! helper.
//!
//! Two distinct mechanisms live here, both grounded in the same table:
//! - [`RunGuard::acquire`]/[`Lease`]: keyed by an arbitrary `task_key`
//!   (typically `task-name:idempotency-key`), it suppresses a
//!   duplicate invocation outright once a prior attempt under the same key
//!   has reached SUCCESS, and serializes concurrent attempts under the
//!   same key in between (used by the `etl guard` CLI wrapper).
//! - [`RunGuard::reconcile_zombies`]: keyed by API name, it reconciles a
//!   watermark stuck at RUNNING against the run log -- this is the
//!   invariant-3 single-flight check the Stage Runner itself makes before
//!   every run, independent of whether the `guard` wrapper is in use at
//!   all.
//!
//! Version dependencies:
//! - sqlx = "0.7"
//! - chrono = "0.4"
//! - tracing = "0.1"
//! - thiserror = "1.0"

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::run_log::RunLog;
use crate::watermark::{RunStatus, WatermarkStore};

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("{task_key} is already running (lease held since {held_since})")]
    AlreadyRunning {
        task_key: String,
        held_since: DateTime<Utc>,
    },
    #[error("{task_key} already completed successfully; skipping duplicate invocation")]
    AlreadySatisfied { task_key: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Watermark(#[from] crate::watermark::WatermarkError),
    #[error(transparent)]
    RunLog(#[from] crate::run_log::RunLogError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
enum GuardStatus {
    Running,
    Success,
    Failed,
}

/// A held single-flight/idempotency lease. The underlying row is never
/// deleted -- it is always resolved to SUCCESS
/// or FAILED so a later invocation under the same key can see it.
pub struct Lease {
    pub run_id: Uuid,
    task_key: String,
    pool: PgPool,
}

impl Lease {
    #[instrument(skip(self))]
    pub async fn mark_success(self) -> Result<(), GuardError> {
        sqlx::query!(
            r#"UPDATE meta_retry_guard SET status = 'SUCCESS', finished_at = now() WHERE task_key = $1 AND run_id = $2"#,
            self.task_key,
            self.run_id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn mark_failed(self) -> Result<(), GuardError> {
        sqlx::query!(
            r#"UPDATE meta_retry_guard SET status = 'FAILED', finished_at = now() WHERE task_key = $1 AND run_id = $2"#,
            self.task_key,
            self.run_id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn task_key(&self) -> &str {
        &self.task_key
    }
}

pub struct RunGuard {
    pool: PgPool,
    stale_after: ChronoDuration,
}

impl RunGuard {
    pub fn new(pool: PgPool, stale_after: ChronoDuration) -> Self {
        Self { pool, stale_after }
    }

    /// Attempts to acquire the lease for `task_key`. Refuses with
    /// [`GuardError::AlreadySatisfied`] when a prior attempt under this key
    /// reached SUCCESS; refuses with
    /// [`GuardError::AlreadyRunning`] when a live lease is held; reclaims
    /// and replaces a lease whose `acquired_at` is older than
    /// `stale_after`; otherwise starts (or restarts, after a prior FAILED)
    /// a fresh RUNNING lease.
    #[instrument(skip(self))]
    pub async fn acquire(&self, task_key: &str) -> Result<Lease, GuardError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query!(
            r#"SELECT run_id, status as "status: GuardStatus", acquired_at
               FROM meta_retry_guard WHERE task_key = $1 FOR UPDATE"#,
            task_key,
        )
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = &existing {
            match row.status {
                GuardStatus::Success => {
                    return Err(GuardError::AlreadySatisfied { task_key: task_key.to_string() });
                }
                GuardStatus::Running => {
                    let age = Utc::now() - row.acquired_at;
                    if age < self.stale_after {
                        return Err(GuardError::AlreadyRunning {
                            task_key: task_key.to_string(),
                            held_since: row.acquired_at,
                        });
                    }
                    warn!(task_key, held_since = %row.acquired_at, "reclaiming stale run-guard lease");
                }
                GuardStatus::Failed => {
                    info!(task_key, "retrying task previously marked FAILED");
                }
            }
        }

        let run_id = Uuid::new_v4();
        sqlx::query!(
            r#"INSERT INTO meta_retry_guard (task_key, run_id, status, acquired_at, finished_at)
               VALUES ($1, $2, 'RUNNING', now(), NULL)
               ON CONFLICT (task_key) DO UPDATE
               SET run_id = EXCLUDED.run_id, status = 'RUNNING', acquired_at = now(), finished_at = NULL"#,
            task_key,
            run_id,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(task_key, %run_id, "acquired run guard lease");
        Ok(Lease { run_id, task_key: task_key.to_string(), pool: self.pool.clone() })
    }

    /// Reconciles a watermark left in RUNNING against the run log: if the
    /// most recent run-log entry for the API finished (success or
    /// failure), the watermark is a stale artifact of a crash between the
    /// writer committing and the watermark being updated, and is reset to
    /// FAILED so the next scheduling pass retries it. Returns `Ok(false)`
    /// when the RUNNING watermark corresponds to a genuinely live run log
    /// entry younger than `stale_after` -- the caller must treat that as a
    /// concurrent-run rejection, not a reclaim.
    #[instrument(skip(self, watermark_store, run_log))]
    pub async fn reconcile_zombies(
        &self,
        api_name: &str,
        watermark_store: &WatermarkStore,
        run_log: &RunLog,
    ) -> Result<bool, GuardError> {
        let watermark = watermark_store.try_read(api_name).await?;
        let is_running = matches!(watermark.map(|w| w.status), Some(RunStatus::Running));
        if !is_running {
            return Ok(false);
        }

        let latest = run_log.latest(api_name).await?;
        let reclaim = match latest {
            Some(entry) if entry.finished_at.is_some() => true,
            Some(entry) => {
                let age = Utc::now() - entry.started_at;
                age > self.stale_after
            }
            None => true,
        };

        if reclaim {
            watermark_store
                .mark_failed(api_name, "reclaimed: watermark left RUNNING with no live run")
                .await?;
            warn!(api_name, "reclaimed zombie watermark left in RUNNING state");
        }
        Ok(reclaim)
    }

    /// `true` when the watermark is RUNNING and does *not* correspond to a
    /// reclaimable zombie -- i.e. a genuinely live run is in flight. Used
    /// by the Stage Runner to enforce invariant 3 before opening a new run
    /// or marking a fresh watermark RUNNING.
    pub async fn is_concurrently_running(
        &self,
        api_name: &str,
        watermark_store: &WatermarkStore,
        run_log: &RunLog,
    ) -> Result<bool, GuardError> {
        let Some(watermark) = watermark_store.try_read(api_name).await? else {
            return Ok(false);
        };
        if watermark.status != RunStatus::Running {
            return Ok(false);
        }
        let reclaimed = self.reconcile_zombies(api_name, watermark_store, run_log).await?;
        Ok(!reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_running_error_reports_hold_time() {
        let now = Utc::now();
        let err = GuardError::AlreadyRunning {
            task_key: "daily".into(),
            held_since: now,
        };
        assert!(err.to_string().contains("daily"));
    }

    #[test]
    fn already_satisfied_error_names_the_task_key() {
        let err = GuardError::AlreadySatisfied { task_key: "daily_pipeline:20240111".into() };
        assert!(err.to_string().contains("daily_pipeline:20240111"));
    }
}
