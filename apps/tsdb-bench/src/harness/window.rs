use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::fmt;
use std::time::Duration;

/// Half-open `[start, end)` range handed to a downsample query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownsampleWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DownsampleWindow {
    /// The epoch-aligned bucket containing `now`: `start` is the largest
    /// multiple of `bucket` at or before `now`.
    pub fn containing(now: DateTime<Utc>, bucket: Duration) -> Self {
        let bucket_ms = bucket_millis(bucket);
        let start = align_down(now, bucket_ms);
        Self {
            start,
            end: start + ChronoDuration::milliseconds(bucket_ms),
        }
    }
}

#[cfg(test)]
impl DownsampleWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn bucket(&self) -> ChronoDuration {
        self.end - self.start
    }
}

impl fmt::Display for DownsampleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

fn bucket_millis(bucket: Duration) -> i64 {
    i64::try_from(bucket.as_millis()).unwrap_or(i64::MAX).max(1)
}

pub(crate) fn align_down(ts: DateTime<Utc>, bucket_ms: i64) -> DateTime<Utc> {
    let bucket_ms = bucket_ms.max(1);
    let ts_ms = ts.timestamp_millis();
    let aligned_ms = ts_ms.div_euclid(bucket_ms) * bucket_ms;
    Utc.timestamp_millis_opt(aligned_ms).single().unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::DownsampleWindow;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    const FIFTEEN_MIN: Duration = Duration::from_secs(15 * 60);

    #[test]
    fn window_starts_on_bucket_boundary() {
        let now = Utc.with_ymd_and_hms(2023, 2, 9, 6, 54, 31).unwrap();
        let window = DownsampleWindow::containing(now, FIFTEEN_MIN);
        assert_eq!(window.start, Utc.with_ymd_and_hms(2023, 2, 9, 6, 45, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2023, 2, 9, 7, 0, 0).unwrap());
        assert!(window.contains(now));
        assert_eq!(window.bucket(), ChronoDuration::minutes(15));
    }

    #[test]
    fn instant_on_boundary_opens_new_window() {
        let now = Utc.with_ymd_and_hms(2023, 2, 9, 7, 0, 0).unwrap();
        let window = DownsampleWindow::containing(now, FIFTEEN_MIN);
        assert_eq!(window.start, now);
        assert!(window.contains(now));
        assert!(!window.contains(window.end));
    }

    #[test]
    fn start_is_largest_multiple_not_after_now() {
        let bucket = Duration::from_secs(7);
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        for offset_ms in [0i64, 1, 999, 6_999, 7_000, 13_501, 86_399_999] {
            let now = base + ChronoDuration::milliseconds(offset_ms);
            let window = DownsampleWindow::containing(now, bucket);
            let start_ms = window.start.timestamp_millis();
            assert_eq!(start_ms % 7_000, 0);
            assert!(start_ms <= now.timestamp_millis());
            assert!(now.timestamp_millis() - start_ms < 7_000);
            assert_eq!(window.end - window.start, ChronoDuration::seconds(7));
            assert!(window.contains(now));
        }
    }

    #[test]
    fn aligns_instants_before_epoch() {
        let now = Utc.timestamp_millis_opt(-1).unwrap();
        let window = DownsampleWindow::containing(now, Duration::from_secs(60));
        assert_eq!(window.start.timestamp_millis(), -60_000);
        assert_eq!(window.end.timestamp_millis(), 0);
        assert!(window.contains(now));
    }
}
