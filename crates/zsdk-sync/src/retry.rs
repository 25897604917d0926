//! Backoff helpers shared by the processor and the gRPC client.

use rand::Rng;
use std::time::Duration;

/// Randomize a delay by ±20% so reconnecting clients spread out.
pub fn jitter_duration(duration: Duration) -> Duration {
    let millis = duration.as_millis() as u64;
    if millis == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    let jittered = (millis as f64 * jitter) as u64;
    Duration::from_millis(jittered.max(1))
}

/// Exponential backoff for the `attempt`-th consecutive failure (1-based),
/// jittered and capped at `max`.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let raw = base.saturating_mul(1u32 << exponent).min(max);
    jitter_duration(raw).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = jitter_duration(base);
            assert!(d >= Duration::from_millis(800));
            assert!(d <= Duration::from_millis(1200));
        }
        assert_eq!(jitter_duration(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        assert!(backoff_delay(base, 1, max) <= Duration::from_millis(120));
        assert!(backoff_delay(base, 4, max) >= Duration::from_millis(640));
        for _ in 0..50 {
            let capped = backoff_delay(base, 40, max);
            assert!(capped <= max);
            assert!(capped >= Duration::from_secs(4));
        }
    }
}
