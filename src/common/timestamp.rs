use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since UNIX_EPOCH. A clock set before the epoch
/// reads as 0.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Time elapsed since `earlier_ms`, saturating at zero for future stamps.
pub fn age_of(earlier_ms: u64) -> Duration {
    Duration::from_millis(now_ms().saturating_sub(earlier_ms))
}
