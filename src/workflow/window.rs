use std::time::Duration;

/// Time to wait before the next expiration check: the remaining time until
/// `expiration_ms`, clamped to `[min_delay, max_delay]`.
///
/// Pure; the caller supplies the replay-stable `now_ms`. When the
/// expiration already passed the result is `min_delay`, so callers must
/// check expiration again after waking. Assumes `min_delay <= max_delay`,
/// which `WaitPolicy` enforces.
pub fn compute_window(expiration_ms: u64, now_ms: u64, min_delay: Duration, max_delay: Duration) -> Duration {
    let remaining = i128::from(expiration_ms) - i128::from(now_ms);
    let min = i128::try_from(min_delay.as_millis()).unwrap_or(i128::MAX);
    let max = i128::try_from(max_delay.as_millis()).unwrap_or(i128::MAX);
    let clamped = remaining.max(min).min(max);
    Duration::from_millis(u64::try_from(clamped).unwrap_or(u64::MAX))
}

/// Absolute deadline for a timer started at `now_ms`.
pub fn wakeup_time(now_ms: u64, window: Duration) -> u64 {
    now_ms.saturating_add(u64::try_from(window.as_millis()).unwrap_or(u64::MAX))
}
