//! Reconnect pacing.

use std::time::Duration;

use rand::Rng;

/// Delay before probe attempt number `attempt` (1-based).
///
/// Grows linearly to a 10 second ceiling, with up to 2 seconds of jitter
/// so a fleet of clients does not hammer a recovering server in lockstep.
pub(crate) fn probe_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(u64::from(attempt.min(10)) * 1000);
    let jitter = Duration::from_millis(rand::rng().random_range(0..2000));
    base + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_with_attempts_up_to_the_ceiling() {
        for attempt in 1..=20 {
            let delay = probe_delay(attempt);
            let base = Duration::from_millis(u64::from(attempt.min(10)) * 1000);
            assert!(delay >= base, "attempt {attempt}: {delay:?} below base");
            assert!(
                delay < base + Duration::from_millis(2000),
                "attempt {attempt}: {delay:?} exceeds jitter window"
            );
        }
    }

    #[test]
    fn ceiling_is_ten_seconds_plus_jitter() {
        let delay = probe_delay(1000);
        assert!(delay >= Duration::from_secs(10));
        assert!(delay < Duration::from_secs(12));
    }
}
