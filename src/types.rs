//! Core domain types shared by every stage of the ETL engine: trade dates,
//! API descriptors, and the run/stage vocabulary the rest of the crate is
//! built from.
//!
//! Version dependencies:
//! - chrono = "0.4"
//! - serde = "1.0"
//! - thiserror = "1.0"

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::page::PageSchema;

/// An 8-digit `YYYYMMDD` trading day, compared as a plain integer per
/// the wire/storage contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeDate(pub i32);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TradeDateError {
    #[error("not an 8-digit YYYYMMDD value: {0}")]
    OutOfRange(i32),
    #[error("not a calendar date: {0}")]
    InvalidCalendarDate(i32),
}

impl TradeDate {
    pub fn new(yyyymmdd: i32) -> Result<Self, TradeDateError> {
        if !(1_0000_0101..=9999_1231).contains(&yyyymmdd) {
            return Err(TradeDateError::OutOfRange(yyyymmdd));
        }
        let date = TradeDate(yyyymmdd);
        date.to_naive_date()
            .ok_or(TradeDateError::InvalidCalendarDate(yyyymmdd))?;
        Ok(date)
    }

    pub fn from_naive_date(date: NaiveDate) -> Self {
        use chrono::Datelike;
        TradeDate(date.year() * 1_00_00 + date.month() as i32 * 1_00 + date.day() as i32)
    }

    pub fn to_naive_date(self) -> Option<NaiveDate> {
        let year = self.0 / 1_00_00;
        let month = (self.0 / 1_00) % 1_00;
        let day = self.0 % 1_00;
        NaiveDate::from_ymd_opt(year, month as u32, day as u32)
    }

    pub fn succ(self) -> TradeDate {
        TradeDate::from_naive_date(
            self.to_naive_date()
                .expect("TradeDate always wraps a valid calendar date")
                .succ_opt()
                .expect("TradeDate::succ overflowed the calendar"),
        )
    }

    pub fn pred(self) -> TradeDate {
        TradeDate::from_naive_date(
            self.to_naive_date()
                .expect("TradeDate always wraps a valid calendar date")
                .pred_opt()
                .expect("TradeDate::pred underflowed the calendar"),
        )
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl fmt::Display for TradeDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inclusive, possibly-empty range of calendar dates. Calendar filtering
/// to trading days only happens where a [`crate::calendar::TradingCalendar`]
/// is available (see [`crate::calendar`]); this type alone makes no such
/// guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: TradeDate,
    pub end: TradeDate,
}

impl DateRange {
    /// Returns `None` when `start > end` (an empty range, the "no-op
    /// success" case `stage.rs` relies on).
    pub fn new(start: TradeDate, end: TradeDate) -> Option<Self> {
        if start > end {
            None
        } else {
            Some(Self { start, end })
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Clamps `end` down to `cap`, returning `None` if the resulting range
    /// is empty. This is the mechanism behind Scenario F's watermark clamp.
    pub fn clamp_end(self, cap: TradeDate) -> Option<Self> {
        DateRange::new(self.start, self.end.min(cap))
    }
}

/// Whether an upstream API is required for the pipeline to be considered
/// successful (`Core`) or may be skipped under lenient policy (`Feature`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Criticality {
    Core,
    Feature,
}

/// How an API's cursor advances: by trade date, by announcement date (for
/// point-in-time financial data), or by a flat entity enumeration with no
/// date cursor at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorKind {
    ByTradeDate,
    ByAnnouncementDate,
    ByEntityId,
}

/// The static definition of one upstream endpoint. Constructed once at process startup and held in a
/// registry; never mutated.
#[derive(Debug, Clone)]
pub struct ApiDescriptor {
    /// Unique logical name; also the Watermark Store and Run Log key.
    pub name: &'static str,
    pub cursor_kind: CursorKind,
    /// Name of the rate-limit bucket this API draws from.
    pub rate_bucket: &'static str,
    pub page_size: usize,
    pub target_table: &'static str,
    pub primary_key: &'static [&'static str],
    /// Hours after market events before the API's data for "today" can be
    /// considered ready (e.g. 20 for an evening financial-enhancement feed).
    pub readiness_lag_hours: u32,
    pub criticality: Criticality,
    /// The page shape this API's responses must conform to; an unknown
    /// column is column drift (`spec.md` §6, "Column name drift is a fatal
    /// schema error"), caught at `Page::from_json_rows` before a fetch's
    /// result ever reaches the writer.
    pub schema: &'static PageSchema,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_date_rejects_invalid_calendar_dates() {
        assert!(TradeDate::new(20240231).is_err());
        assert!(TradeDate::new(20240229).is_ok()); // leap year
        assert!(TradeDate::new(20230229).is_err());
    }

    #[test]
    fn trade_date_succ_crosses_month_boundary() {
        let d = TradeDate::new(20240131).unwrap();
        assert_eq!(d.succ(), TradeDate::new(20240201).unwrap());
    }

    #[test]
    fn date_range_empty_when_start_after_end() {
        let start = TradeDate::new(20240115).unwrap();
        let end = TradeDate::new(20240110).unwrap();
        assert!(DateRange::new(start, end).is_none());
    }

    #[test]
    fn date_range_clamp_end_to_cap() {
        let range = DateRange::new(
            TradeDate::new(20240110).unwrap(),
            TradeDate::new(20251231).unwrap(),
        )
        .unwrap();
        let cap = TradeDate::new(20240115).unwrap();
        let clamped = range.clamp_end(cap).unwrap();
        assert_eq!(clamped.end, cap);
    }

    #[test]
    fn date_range_clamp_end_can_empty_the_range() {
        let range = DateRange::new(
            TradeDate::new(20240120).unwrap(),
            TradeDate::new(20240125).unwrap(),
        )
        .unwrap();
        let cap = TradeDate::new(20240110).unwrap();
        assert!(range.clamp_end(cap).is_none());
    }
}
