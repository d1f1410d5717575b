//! Exponential backoff with jitter between submission attempts.

use rand::Rng;
use std::time::Duration;

use crate::config::schema::SubmitterConfig;

/// Delay before retry number `retry` (1-based) under the submitter's policy.
///
/// Doubles from `base_delay_ms` up to `max_delay_ms`, then adds up to 10%
/// jitter so wallets that failed together do not retry in lockstep.
pub fn submit_backoff(retry: u32, policy: &SubmitterConfig) -> Duration {
    let Some(step) = retry.checked_sub(1) else {
        return Duration::ZERO;
    };
    let factor = 1u64.checked_shl(step).unwrap_or(u64::MAX);
    let delay_ms = policy
        .base_delay_ms
        .saturating_mul(factor)
        .min(policy.max_delay_ms);

    let jitter_ms = match delay_ms / 10 {
        0 => 0,
        spread => rand::thread_rng().gen_range(0..spread),
    };
    Duration::from_millis(delay_ms + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_delay_ms: u64, max_delay_ms: u64) -> SubmitterConfig {
        SubmitterConfig {
            base_delay_ms,
            max_delay_ms,
            ..SubmitterConfig::default()
        }
    }

    #[test]
    fn test_delay_doubles_until_capped() {
        let p = policy(100, 1_000);
        assert_eq!(submit_backoff(0, &p), Duration::ZERO);

        let first = submit_backoff(1, &p).as_millis();
        assert!((100..110).contains(&first));
        let third = submit_backoff(3, &p).as_millis();
        assert!((400..440).contains(&third));
        let capped = submit_backoff(12, &p).as_millis();
        assert!((1_000..1_100).contains(&capped));
    }

    #[test]
    fn test_delay_does_not_overflow() {
        let d = submit_backoff(u32::MAX, &policy(u64::MAX, 5_000));
        assert!(d.as_millis() < 5_500);
    }
}
