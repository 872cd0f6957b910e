//! Crate-wide error aggregate. Each subsystem defines its own `thiserror`
//! enum; this module collects them behind one top-level `EtlError`
//! rather than leaking a dozen subsystem error types to every caller.
//!
//! Version dependencies:
//! - thiserror = "1.0"

use thiserror::Error;

use crate::fetcher::FetchError;
use crate::guard::GuardError;
use crate::quality::QualityError;
use crate::run_log::RunLogError;
use crate::stage::StageError;
use crate::watermark::WatermarkError;
use crate::writer::WriteError;

/// Every distinguishable failure kind the orchestration engine can
/// surface, mapped onto this crate's subsystem error types.
#[derive(Debug, Error)]
pub enum EtlError {
    /// Surfaces only after the Fetcher exhausts its retry budget.
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Constraint violation other than PK conflict, disk-full, or any
    /// other writer-side failure.
    #[error("write failed: {0}")]
    Write(#[from] WriteError),

    #[error("watermark error: {0}")]
    Watermark(#[from] WatermarkError),

    #[error("run log error: {0}")]
    RunLog(#[from] RunLogError),

    /// A concurrent-run rejection from the guard.
    #[error("concurrent run rejected: {0}")]
    Guard(#[from] GuardError),

    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    /// A HIGH-severity quality assertion failure.
    #[error("quality check error: {0}")]
    Quality(#[from] QualityError),

    /// A dependent layer's watermark has not caught up to the stage's
    /// requested range.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// External cancel signal, terminal, not retried.
    #[error("run cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EtlResult<T> = Result<T, EtlError>;
