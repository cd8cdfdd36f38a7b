//! Reconnect backoff policy.

use std::time::Duration;

/// Exponential backoff for automatic reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Automatic attempts before the budget is exhausted.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Upper bound on any delay, jitter included.
    pub max_delay: Duration,
    /// ±25% jitter.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)` for a 0-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let capped = base.saturating_mul(factor).min(max);

        let final_ms = if self.jitter {
            let jitter_range = capped as f64 * 0.25;
            let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
            (capped as f64 + jitter).clamp(0.0, max as f64) as u64
        } else {
            capped
        };

        Duration::from_millis(final_ms)
    }

    /// Whether another automatic attempt fits in the budget, given how many
    /// have already been made.
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = ReconnectPolicy {
            max_delay: Duration::from_millis(10_000),
            ..ReconnectPolicy::default()
        };
        let delays: Vec<u128> = (0..6)
            .map(|a| policy.delay_for_attempt(a).as_millis())
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
    }

    #[test]
    fn test_delay_does_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(64).as_millis(), 30_000);
        assert_eq!(policy.delay_for_attempt(u32::MAX).as_millis(), 30_000);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = ReconnectPolicy {
            jitter: true,
            ..ReconnectPolicy::default()
        };
        for attempt in 0..8 {
            let nominal = ReconnectPolicy::default().delay_for_attempt(attempt);
            let d = policy.delay_for_attempt(attempt);
            assert!(d <= policy.max_delay);
            assert!(d.as_millis() as f64 >= nominal.as_millis() as f64 * 0.75 - 1.0);
        }
    }

    #[test]
    fn test_budget() {
        let policy = ReconnectPolicy::default();
        assert!(policy.allows(0));
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }
}
