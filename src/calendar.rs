//! Trading-day arithmetic. Calendar rows are loaded once per
//! process and cached behind a lock; a refresh is triggered when a lookup
//! requests a date beyond the cached horizon.
//!
//! Version dependencies:
//! - chrono = "0.4"
//! - tokio = "1.28"
//! - async-trait = "0.1"
//! - thiserror = "1.0"
//! - tracing = "0.1"

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::types::TradeDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarEntry {
    pub date: TradeDate,
    pub is_open: bool,
}

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("calendar is empty: cannot resolve today-cap without authoritative calendar rows")]
    EmptyCalendar,
    #[error("no trading day found on or before {0}")]
    NoTradingDayOnOrBefore(TradeDate),
    #[error("no trading day found on or after {0}")]
    NoTradingDayOnOrAfter(TradeDate),
    #[error("failed to refresh calendar: {0}")]
    RefreshFailed(String),
}

/// Source of authoritative calendar rows, refreshed lazily. Implemented by
/// a Fetcher-backed adapter in production and by a fixed in-memory fixture
/// in tests — an explicit collaborator seam rather than a module-level
/// singleton.
#[async_trait]
pub trait CalendarSource: Send + Sync {
    /// Returns all entries known up to and including `horizon`.
    async fn load_up_to(&self, horizon: TradeDate) -> Result<Vec<CalendarEntry>, CalendarError>;
}

/// Cached, lock-protected trading calendar. All lookups are integer
/// comparisons over a sorted `Vec`.
pub struct TradingCalendar {
    source: Box<dyn CalendarSource>,
    entries: RwLock<Vec<CalendarEntry>>,
    horizon: RwLock<TradeDate>,
}

impl TradingCalendar {
    pub fn new(source: Box<dyn CalendarSource>, initial_horizon: TradeDate) -> Self {
        Self {
            source,
            entries: RwLock::new(Vec::new()),
            horizon: RwLock::new(initial_horizon),
        }
    }

    #[instrument(skip(self))]
    async fn ensure_loaded_through(&self, horizon: TradeDate) -> Result<(), CalendarError> {
        {
            let entries = self.entries.read().await;
            let cached_horizon = *self.horizon.read().await;
            if !entries.is_empty() && cached_horizon >= horizon {
                return Ok(());
            }
        }

        info!(%horizon, "refreshing trading calendar cache");
        let mut fresh = self.source.load_up_to(horizon).await?;
        fresh.sort_by_key(|e| e.date);
        fresh.dedup_by_key(|e| e.date);

        let mut entries = self.entries.write().await;
        *entries = fresh;
        let mut cached_horizon = self.horizon.write().await;
        *cached_horizon = horizon;
        Ok(())
    }

    /// The greatest trading day ≤ wall-clock today in the market's time
    /// zone, adjusted so future calendar rows can never be claimed.
    /// Hard-errors on an empty calendar rather than proceeding with a
    /// speculative date.
    #[instrument(skip(self))]
    pub async fn today_cap(&self) -> Result<TradeDate, CalendarError> {
        let today = TradeDate::from_naive_date(Utc::now().date_naive());
        self.ensure_loaded_through(today).await?;
        self.previous_trading_day_inclusive(today).await
    }

    /// `previous_trading_day(d)`: the greatest trading day ≤ `d`.
    #[instrument(skip(self))]
    pub async fn previous_trading_day_inclusive(
        &self,
        d: TradeDate,
    ) -> Result<TradeDate, CalendarError> {
        self.ensure_loaded_through(d).await?;
        let entries = self.entries.read().await;
        if entries.is_empty() {
            return Err(CalendarError::EmptyCalendar);
        }
        entries
        .iter()
        .rev()
        .find(|e| e.date <= d && e.is_open)
        .map(|e| e.date)
        .ok_or(CalendarError::NoTradingDayOnOrBefore(d))
    }

    /// The strict previous trading day, i.e. `previous_trading_day(d - 1
    /// day)`.
    pub async fn previous_trading_day(&self, d: TradeDate) -> Result<TradeDate, CalendarError> {
        self.previous_trading_day_inclusive(d.pred()).await
    }

    /// `next_trading_day(d)`: the least trading day ≥ `d`.
    #[instrument(skip(self))]
    pub async fn next_trading_day(&self, d: TradeDate) -> Result<TradeDate, CalendarError> {
        // The horizon only needs to extend past `d`; callers asking for a
        // next trading day far in the future will simply refresh further.
        self.ensure_loaded_through(d).await?;
        let entries = self.entries.read().await;
        if entries.is_empty() {
            return Err(CalendarError::EmptyCalendar);
        }
        match entries.iter().find(|e| e.date >= d && e.is_open) {
            Some(e) => Ok(e.date),
            None => {
                warn!(%d, "next_trading_day requested beyond cached horizon");
                Err(CalendarError::NoTradingDayOnOrAfter(d))
            }
        }
    }

    /// A finite ordered sequence of trading days in `[a, b]`.
    #[instrument(skip(self))]
    pub async fn trading_days_between(
        &self,
        a: TradeDate,
        b: TradeDate,
    ) -> Result<Vec<TradeDate>, CalendarError> {
        if a > b {
            return Ok(Vec::new());
        }
        self.ensure_loaded_through(b).await?;
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.is_open && e.date >= a && e.date <= b)
            .map(|e| e.date)
            .collect())
    }
}

/// Renders a `chrono` UTC instant as a `TradeDate`, used by callers that
/// need "today" without going through the calendar (e.g. readiness-lag
/// comparisons in the pipeline coordinator).
pub fn wall_clock_today() -> TradeDate {
    TradeDate::from_naive_date(Utc::now().date_naive())
}

/// Test/fixture calendar source backed by a fixed list of entries.
pub struct FixedCalendarSource {
    pub entries: Vec<CalendarEntry>,
}

#[async_trait]
impl CalendarSource for FixedCalendarSource {
    async fn load_up_to(&self, _horizon: TradeDate) -> Result<Vec<CalendarEntry>, CalendarError> {
        Ok(self.entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> TradingCalendar {
        // Jan 2024: 10th-12th are weekdays; 11th is the only open day in
        // this fixture.
        let entries = vec![
            CalendarEntry { date: TradeDate::new(20240108).unwrap(), is_open: true },
            CalendarEntry { date: TradeDate::new(20240109).unwrap(), is_open: true },
            CalendarEntry { date: TradeDate::new(20240110).unwrap(), is_open: true },
            CalendarEntry { date: TradeDate::new(20240111).unwrap(), is_open: true },
            CalendarEntry { date: TradeDate::new(20240112).unwrap(), is_open: false },
            CalendarEntry { date: TradeDate::new(20240113).unwrap(), is_open: false },
            CalendarEntry { date: TradeDate::new(20240115).unwrap(), is_open: true },
        ];
        TradingCalendar::new(
            Box::new(FixedCalendarSource { entries }),
            TradeDate::new(20240115).unwrap(),
        )
    }

    #[tokio::test]
    async fn previous_trading_day_inclusive_skips_closed_days() {
        let cal = fixture();
        let d = cal
        .previous_trading_day_inclusive(TradeDate::new(20240113).unwrap())
        .await
        .unwrap();
        assert_eq!(d, TradeDate::new(20240111).unwrap());
    }

    #[tokio::test]
    async fn next_trading_day_skips_closed_days() {
        let cal = fixture();
        let d = cal
        .next_trading_day(TradeDate::new(20240112).unwrap())
        .await
        .unwrap();
        assert_eq!(d, TradeDate::new(20240115).unwrap());
    }

    #[tokio::test]
    async fn trading_days_between_excludes_closed_days() {
        let cal = fixture();
        let days = cal
        .trading_days_between(
            TradeDate::new(20240110).unwrap(),
            TradeDate::new(20240115).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(
            days,
            vec![
                TradeDate::new(20240110).unwrap(),
                TradeDate::new(20240111).unwrap(),
                TradeDate::new(20240115).unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn empty_calendar_is_a_hard_error() {
        let cal = TradingCalendar::new(
            Box::new(FixedCalendarSource { entries: vec![] }),
            TradeDate::new(20240115).unwrap(),
        );
        assert!(matches!(
                cal.today_cap().await,
                Err(CalendarError::EmptyCalendar)
        ));
    }
}
