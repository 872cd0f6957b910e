//! Timestamp helpers shared by the metrics and logging layers.
//!
//! Version dependencies:
//! - chrono = "0.4"

use chrono::{DateTime, Utc};
use std::time::SystemTime;

#[inline]
pub fn current_timestamp() -> DateTime<Utc> {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH + d))
        .unwrap_or_else(|_| Utc::now())
}

/// Milliseconds elapsed between two timestamps, for recording fetch and
/// write latencies. Negative durations (clock skew) are clamped to zero.
pub fn calculate_duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn duration_ms_clamps_negative_skew_to_zero() {
        let now = current_timestamp();
        let earlier = now - Duration::seconds(5);
        assert_eq!(calculate_duration_ms(now, earlier), 0);
    }

    #[test]
    fn duration_ms_computes_elapsed_milliseconds() {
        let start = current_timestamp();
        let end = start + Duration::milliseconds(250);
        assert_eq!(calculate_duration_ms(start, end), 250);
    }
}
