/// Delay before poll attempt `attempt` (1-based) against an external service.
///
/// Attempt 1 waits `base_ms`, each further attempt doubles the delay, and the
/// result never exceeds `max_ms`.
pub fn poll_backoff_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << shift).min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(poll_backoff_ms(0, 500, 8_000), 500);
        assert_eq!(poll_backoff_ms(1, 500, 8_000), 500);
        assert_eq!(poll_backoff_ms(2, 500, 8_000), 1_000);
        assert_eq!(poll_backoff_ms(3, 500, 8_000), 2_000);
        assert_eq!(poll_backoff_ms(5, 500, 8_000), 8_000);
        assert_eq!(poll_backoff_ms(60, 500, 8_000), 8_000);
    }

    #[test]
    fn backoff_does_not_overflow() {
        assert_eq!(poll_backoff_ms(u32::MAX, u64::MAX / 2, u64::MAX), u64::MAX);
    }
}
