//! Backoff delay computation.

use std::time::Duration;

use super::classify::ErrorKind;
use crate::config::RetryPolicy;

/// Jitter spreads a delay by up to this fraction in either direction.
const JITTER_FRACTION: f64 = 0.25;

/// Jittered delays never drop below this.
pub const MIN_JITTERED_DELAY: Duration = Duration::from_millis(100);

/// Delay before the attempt that follows failed attempt `attempt` (1-based).
///
/// A retry-after hint only applies to rate limiting; every other kind uses
/// exponential backoff from `base_delay`. The result is capped at `max_delay`
/// before jitter, so a jittered delay can reach 1.25 × `max_delay`.
pub fn calculate_delay(
    policy: &RetryPolicy,
    attempt: u32,
    kind: ErrorKind,
    retry_after: Option<Duration>,
) -> Duration {
    let max = policy.max_delay.as_secs_f64();
    let base = match retry_after {
        Some(hint) if kind == ErrorKind::RateLimit => {
            hint.as_secs_f64() * policy.rate_limit_recovery_multiplier
        }
        _ => {
            let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
            policy.base_delay.as_secs_f64() * policy.exponential_factor.powi(exponent)
        }
    };
    // NaN or infinity from a huge exponent collapses to the cap.
    let capped = if base.is_finite() { base.min(max) } else { max };

    let secs = if policy.jitter {
        let spread = capped * JITTER_FRACTION;
        let offset = (fastrand::f64() * 2.0 - 1.0) * spread;
        (capped + offset).max(MIN_JITTERED_DELAY.as_secs_f64())
    } else {
        capped.max(0.0)
    };

    // Saturates when `max_delay` sits at or near `Duration::MAX`.
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
            .with_exponential_factor(2.0)
            .with_jitter(false)
    }

    #[test]
    fn first_attempt_uses_base_delay() {
        let policy = steady_policy();
        assert_eq!(
            calculate_delay(&policy, 1, ErrorKind::ServerError, None),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn delay_grows_then_clamps() {
        let policy = steady_policy();
        let delays: Vec<Duration> = (1..=10)
            .map(|attempt| calculate_delay(&policy, attempt, ErrorKind::NetworkError, None))
            .collect();

        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= policy.max_delay));
        assert_eq!(*delays.last().unwrap(), policy.max_delay);
    }

    #[test]
    fn hint_scaled_for_rate_limits_only() {
        let policy = steady_policy().with_rate_limit_recovery_multiplier(1.5);
        let hint = Some(Duration::from_secs(1));

        assert_eq!(
            calculate_delay(&policy, 1, ErrorKind::RateLimit, hint),
            Duration::from_millis(1500)
        );
        assert_eq!(
            calculate_delay(&policy, 1, ErrorKind::ServerError, hint),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn hint_is_capped_at_max_delay() {
        let policy = steady_policy();
        let delay = calculate_delay(
            &policy,
            1,
            ErrorKind::RateLimit,
            Some(Duration::from_secs(600)),
        );
        assert_eq!(delay, policy.max_delay);
    }

    #[test]
    fn jittered_delay_stays_in_bounds() {
        let policy = steady_policy().with_jitter(true);
        let upper = policy.max_delay.mul_f64(1.25);

        for attempt in 1..=12 {
            for _ in 0..200 {
                let delay = calculate_delay(&policy, attempt, ErrorKind::TimeoutError, None);
                assert!(delay >= MIN_JITTERED_DELAY, "{delay:?} below floor");
                assert!(delay <= upper, "{delay:?} above 1.25 x max");
            }
        }
    }

    #[test]
    fn jitter_floor_applies_to_tiny_delays() {
        let policy = steady_policy()
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(true);
        let delay = calculate_delay(&policy, 1, ErrorKind::ServerError, None);
        assert_eq!(delay, MIN_JITTERED_DELAY);
    }

    #[test]
    fn uncapped_policy_saturates_instead_of_panicking() {
        let policy = steady_policy().with_max_delay(Duration::MAX);
        assert_eq!(
            calculate_delay(&policy, 200, ErrorKind::ServerError, None),
            Duration::MAX
        );

        let jittered = policy.with_jitter(true);
        for _ in 0..50 {
            let delay = calculate_delay(&jittered, 200, ErrorKind::ServerError, None);
            assert!(delay >= Duration::from_secs(u64::MAX / 2), "{delay:?}");
        }
    }

    #[test]
    fn jitter_above_a_near_max_cap_saturates() {
        let policy = steady_policy()
            .with_max_delay(Duration::from_secs(15_000_000_000_000_000_000))
            .with_jitter(true);
        for _ in 0..50 {
            let delay = calculate_delay(&policy, 200, ErrorKind::NetworkError, None);
            assert!(delay >= Duration::from_secs(11_000_000_000_000_000_000), "{delay:?}");
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = steady_policy();
        let delay = calculate_delay(&policy, u32::MAX, ErrorKind::ServerError, None);
        assert_eq!(delay, policy.max_delay);
    }
}
