use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::LookupError;

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Per-endpoint request pacing: a rate limit plus a random gap before each call.
pub struct Throttle {
    limiter: DirectRateLimiter,
    spacing_min: Duration,
    spacing_max: Duration,
}

impl Throttle {
    pub fn new(requests_per_second: u32, spacing_min: Duration, spacing_max: Duration) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rps)),
            spacing_min,
            spacing_max,
        }
    }

    pub async fn wait(&self) {
        self.limiter.until_ready().await;
        let gap = jitter(self.spacing_min, self.spacing_max);
        if !gap.is_zero() {
            tokio::time::sleep(gap).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// `base * 2^attempt` plus up to `base` of random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_backoff.saturating_mul(2u32.saturating_pow(attempt));
        exp + jitter(Duration::ZERO, self.base_backoff)
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of retries, or
/// `token` is cancelled. Transient failures are retried with backoff.
pub async fn with_retry<T, F, Fut>(
    what: &str,
    query: &str,
    policy: RetryPolicy,
    throttle: &Throttle,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, LookupError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LookupError>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(LookupError::Cancelled);
        }

        let result = tokio::select! {
            _ = token.cancelled() => return Err(LookupError::Cancelled),
            r = async {
                throttle.wait().await;
                op().await
            } => r,
        };

        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let backoff = policy.backoff(attempt);
                warn!(
                    "{} lookup for '{}' failed (attempt {}/{}): {}; backing off {:.1}s",
                    what,
                    query,
                    attempt + 1,
                    policy.max_retries,
                    e,
                    backoff.as_secs_f64()
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(LookupError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    Duration::from_millis(fastrand::u64(lo..=hi))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn instant() -> (RetryPolicy, Throttle) {
        (
            RetryPolicy {
                max_retries: 3,
                base_backoff: Duration::ZERO,
            },
            Throttle::new(1000, Duration::ZERO, Duration::ZERO),
        )
    }

    #[tokio::test]
    async fn transient_then_success() {
        let (policy, throttle) = instant();
        let calls = &AtomicU32::new(0);
        let token = CancellationToken::new();
        let r = with_retry("image", "q", policy, &throttle, &token, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LookupError::Transient("timeout".into()))
            } else {
                Ok("url")
            }
        })
        .await;
        assert_eq!(r, Ok("url"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (policy, throttle) = instant();
        let calls = &AtomicU32::new(0);
        let token = CancellationToken::new();
        let r: Result<(), _> = with_retry("price", "q", policy, &throttle, &token, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LookupError::Transient("503".into()))
        })
        .await;
        assert!(matches!(r, Err(LookupError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_not_retried() {
        let (policy, throttle) = instant();
        let calls = &AtomicU32::new(0);
        let token = CancellationToken::new();
        let r: Result<(), _> = with_retry("price", "q", policy, &throttle, &token, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LookupError::Permanent("bad json".into()))
        })
        .await;
        assert!(matches!(r, Err(LookupError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_issues_nothing() {
        let (policy, throttle) = instant();
        let calls = &AtomicU32::new(0);
        let token = CancellationToken::new();
        token.cancel();
        let r: Result<(), _> = with_retry("image", "q", policy, &throttle, &token, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert_eq!(r, Err(LookupError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backoff_grows() {
        let p = RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
        };
        let b0 = p.backoff(0);
        let b2 = p.backoff(2);
        assert!(b0 >= Duration::from_millis(100) && b0 <= Duration::from_millis(200));
        assert!(b2 >= Duration::from_millis(400) && b2 <= Duration::from_millis(500));
    }
}
