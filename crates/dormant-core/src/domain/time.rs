//! chrono / std::time の橋渡し

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// `at + delay`, saturating at the far end of the chrono range.
pub fn add_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - delay`, saturating at the near end of the chrono range.
pub fn sub_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Elapsed time from `earlier` to `later`, zero when `later` is not after `earlier`.
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
