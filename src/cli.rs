//! Command-line surface: `etl run`, `etl check`, `etl guard`.
//!
//! Version dependencies:
//! - clap = "4.4"

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::types::TradeDate;

#[derive(Debug, Parser)]
#[command(name = "etl", version, about = "A-share equity data warehouse ETL engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs a named pipeline end to end.
    Run {
        /// Pipeline name, e.g. "nightly".
        pipeline: String,
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// Overrides the full-backfill start date for first-run APIs.
        #[arg(long)]
        start_date: Option<i32>,
        /// Overrides the end date; defaults to the calendar's today-cap.
        #[arg(long)]
        end_date: Option<i32>,
        /// Forces lenient failure policy regardless of the pipeline's
        /// configured default.
        #[arg(long)]
        lenient: bool,
    },
    /// Checks watermark freshness against an SLO and exits non-zero on
    /// breach, for use as a monitoring probe.
    Check {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// SLO: watermarks older than this many hours are a breach.
        #[arg(long, default_value_t = 26)]
        hours: u32,
    },
    /// Wraps an arbitrary subcommand in the single-flight run guard,
    /// retrying it on non-zero exit and forwarding its final exit code.
    Guard {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        task_name: String,
        #[arg(long)]
        idempotency_key: String,
        #[arg(long, default_value_t = 0)]
        retries: u32,
        #[arg(long, default_value_t = 5)]
        retry_delay: u64,
        #[arg(long, default_value_t = 300)]
        timeout: u64,
        /// The subcommand to run, passed after `--`.
        #[arg(last = true, required = true)]
        subcommand: Vec<String>,
    },
}

impl Command {
    pub fn start_trade_date(&self) -> Option<TradeDate> {
        match self {
            Command::Run { start_date: Some(d),.. } => TradeDate::new(*d).ok(),
            _ => None,
        }
    }

    pub fn end_trade_date(&self) -> Option<TradeDate> {
        match self {
            Command::Run { end_date: Some(d),.. } => TradeDate::new(*d).ok(),
            _ => None,
        }
    }
}

/// Process exit codes: 0 all-success, 1 strict-stage failure, 2
/// configuration error, 3 skipped -- a guarded invocation refused outright
/// because its idempotency key already completed successfully, kept
/// distinct from plain success so a caller can tell "nothing ran" apart
/// from "ran and succeeded" (see DESIGN.md).
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const STAGE_FAILURE: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const SKIPPED: i32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_optional_date_overrides() {
        let cli = Cli::parse_from(["etl", "run", "nightly", "--start-date", "20240101"]);
        match cli.command {
            Command::Run { pipeline, start_date,.. } => {
                assert_eq!(pipeline, "nightly");
                assert_eq!(start_date, Some(20240101));
            }
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn guard_captures_trailing_subcommand() {
        let cli = Cli::parse_from([
                "etl", "guard", "--task-name", "t", "--idempotency-key", "k", "--", "echo", "hi",
        ]);
        match cli.command {
            Command::Guard { subcommand,.. } => assert_eq!(subcommand, vec!["echo", "hi"]),
            _ => panic!("expected Guard"),
        }
    }
}
