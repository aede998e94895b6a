use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock stamp used for `started_at_ms`/`finished_at_ms` on jobs,
/// commands and steps.
pub type EpochMs = i64;

pub fn now_ms() -> EpochMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis)
        .unwrap_or_default()
}

/// Milliseconds in `d`, saturating at `i64::MAX`.
pub fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Time between two stamps; never negative, even if the clock stepped back.
pub fn elapsed_ms(started: EpochMs, finished: EpochMs) -> i64 {
    finished.saturating_sub(started).max(0)
}
