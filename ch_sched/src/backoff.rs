//! ABOUTME: Retry delay computation per strategy with clamping and jitter

use ch_store::{RetryPolicy, RetryStrategy};
use rand::Rng;

/// Delay in milliseconds before retry attempt `attempt` (0-indexed).
///
/// The raw strategy delay is clamped to the policy cap first; jitter then
/// scales the clamped value by a uniform factor in [1 - f, 1 + f]. All
/// arithmetic saturates so a hostile policy cannot overflow.
pub fn retry_delay_ms(policy: &RetryPolicy, attempt: u32) -> i64 {
    let base = policy.retry_delay_ms.max(0);

    let raw = match policy.effective_strategy() {
        RetryStrategy::Fixed => base,
        RetryStrategy::Exponential => {
            // base * 2^k; attempts are bounded at 10 but shifts stay safe anyway
            if attempt >= 62 {
                i64::MAX
            } else {
                base.saturating_mul(1i64 << attempt)
            }
        }
        RetryStrategy::Linear => base.saturating_mul(attempt as i64 + 1),
        RetryStrategy::Fibonacci => base.saturating_mul(fibonacci(attempt + 1)),
    };

    let clamped = raw.min(policy.delay_cap_ms());

    if policy.jitter_enabled && policy.jitter_factor > 0.0 {
        let factor = rand::thread_rng()
            .gen_range(1.0 - policy.jitter_factor..=1.0 + policy.jitter_factor);
        ((clamped as f64) * factor).max(0.0) as i64
    } else {
        clamped
    }
}

/// fib(1) = fib(2) = 1, saturating on overflow
fn fibonacci(n: u32) -> i64 {
    let (mut a, mut b) = (0i64, 1i64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy, base_ms: i64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 10,
            retry_delay_ms: base_ms,
            use_exponential_backoff: false,
            max_retry_delay_ms: None,
            strategy: Some(strategy),
            jitter_enabled: false,
            jitter_factor: 0.2,
        }
    }

    #[test]
    fn test_fixed_delay() {
        let p = policy(RetryStrategy::Fixed, 2000);
        for attempt in 0..5 {
            assert_eq!(retry_delay_ms(&p, attempt), 2000);
        }
    }

    #[test]
    fn test_exponential_delay() {
        let p = policy(RetryStrategy::Exponential, 1000);
        assert_eq!(retry_delay_ms(&p, 0), 1000);
        assert_eq!(retry_delay_ms(&p, 1), 2000);
        assert_eq!(retry_delay_ms(&p, 2), 4000);
        assert_eq!(retry_delay_ms(&p, 3), 8000);
    }

    #[test]
    fn test_linear_delay() {
        let p = policy(RetryStrategy::Linear, 1000);
        assert_eq!(retry_delay_ms(&p, 0), 1000);
        assert_eq!(retry_delay_ms(&p, 1), 2000);
        assert_eq!(retry_delay_ms(&p, 2), 3000);
    }

    #[test]
    fn test_fibonacci_delay() {
        let p = policy(RetryStrategy::Fibonacci, 1000);
        // fib(1)=1, fib(2)=1, fib(3)=2, fib(4)=3, fib(5)=5
        assert_eq!(retry_delay_ms(&p, 0), 1000);
        assert_eq!(retry_delay_ms(&p, 1), 1000);
        assert_eq!(retry_delay_ms(&p, 2), 2000);
        assert_eq!(retry_delay_ms(&p, 3), 3000);
        assert_eq!(retry_delay_ms(&p, 4), 5000);
    }

    #[test]
    fn test_clamp_to_cap() {
        let mut p = policy(RetryStrategy::Exponential, 60_000);
        p.max_retry_delay_ms = Some(120_000);
        assert_eq!(retry_delay_ms(&p, 0), 60_000);
        assert_eq!(retry_delay_ms(&p, 1), 120_000);
        assert_eq!(retry_delay_ms(&p, 5), 120_000);
    }

    #[test]
    fn test_default_cap_is_one_hour() {
        let p = policy(RetryStrategy::Exponential, 60_000);
        assert_eq!(retry_delay_ms(&p, 9), 3_600_000);
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let mut p = policy(RetryStrategy::Fixed, 10_000);
        p.jitter_enabled = true;
        p.jitter_factor = 0.2;
        for _ in 0..200 {
            let delay = retry_delay_ms(&p, 0);
            assert!((8000..=12_000).contains(&delay), "delay {} out of band", delay);
        }
    }

    #[test]
    fn test_legacy_toggle_falls_back_to_exponential() {
        let p = RetryPolicy {
            retry_delay_ms: 1000,
            use_exponential_backoff: true,
            strategy: None,
            jitter_enabled: false,
            ..Default::default()
        };
        assert_eq!(retry_delay_ms(&p, 2), 4000);
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let p = policy(RetryStrategy::Exponential, i64::MAX / 2);
        assert_eq!(retry_delay_ms(&p, 40), 3_600_000);
    }
}
