//! Upstream rate limiting: a concurrency bound plus a token bucket
//!
//! Callers take a concurrency slot first and only then wait for a rate
//! token, so nobody sits on a token while queued for a slot. The slot is
//! returned when the [`RatePermit`] drops, on every exit path; tokens are
//! never returned, the bucket refills over time.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as TokenBucket};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

use crate::error::PipelineError;

/// IGDB allows 4 req/s and 8 in flight per account; stay under both.
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 3.2;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub max_concurrency: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

struct Limits {
    slots: Semaphore,
    bucket: DefaultDirectRateLimiter,
}

/// Shared limiter; one instance guards every request of a run
pub struct RateLimiter {
    limits: Option<Limits>,
}

/// Held for the duration of one upstream call
#[must_use = "the concurrency slot is released as soon as the permit drops"]
pub struct RatePermit<'a> {
    _slot: Option<SemaphorePermit<'a>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, PipelineError> {
        if config.max_concurrency == 0 {
            return Err(PipelineError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if !(config.requests_per_second.is_finite() && config.requests_per_second > 0.0) {
            return Err(PipelineError::Config(format!(
                "requests_per_second must be positive, got {}",
                config.requests_per_second
            )));
        }

        let period = Duration::from_secs_f64(1.0 / config.requests_per_second);
        // A bucket of floor(rps) tokens lets a fresh limiter fire one second's worth at once
        let burst = NonZeroU32::new(config.requests_per_second.floor() as u32)
            .unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "requests_per_second {} is too high",
                    config.requests_per_second
                ))
            })?
            .allow_burst(burst);

        Ok(Self {
            limits: Some(Limits {
                slots: Semaphore::new(config.max_concurrency),
                bucket: TokenBucket::direct(quota),
            }),
        })
    }

    /// A limiter that never waits
    pub fn unlimited() -> Self {
        Self { limits: None }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limits.is_none()
    }

    /// Wait until one more upstream call may be issued
    pub async fn acquire(&self) -> Result<RatePermit<'_>, AcquireError> {
        let Some(limits) = &self.limits else {
            return Ok(RatePermit { _slot: None });
        };

        let slot = limits.slots.acquire().await?;
        limits.bucket.until_ready().await;
        Ok(RatePermit { _slot: Some(slot) })
    }

    /// Free concurrency slots right now (`None` when unlimited)
    pub fn available_slots(&self) -> Option<usize> {
        self.limits.as_ref().map(|l| l.slots.available_permits())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_rejects_invalid_config() {
        assert!(RateLimiter::new(RateLimitConfig {
            requests_per_second: 0.0,
            max_concurrency: 4,
        })
        .is_err());
        assert!(RateLimiter::new(RateLimitConfig {
            requests_per_second: 3.2,
            max_concurrency: 0,
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_permit_releases_slot_on_drop() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 1000.0,
            max_concurrency: 2,
        })
        .unwrap();

        let first = limiter.acquire().await.unwrap();
        let _second = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available_slots(), Some(0));

        drop(first);
        assert_eq!(limiter.available_slots(), Some(1));
    }

    #[tokio::test]
    async fn test_rate_is_enforced_after_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 20.0,
            max_concurrency: 1,
        })
        .unwrap();

        let started = Instant::now();
        // 20 burst tokens, then 10 more at 50ms each
        for _ in 0..30 {
            let _permit = limiter.acquire().await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        assert!(limiter.is_unlimited());
        let permits: Vec<_> = futures::future::join_all((0..100).map(|_| limiter.acquire()))
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(permits.len(), 100);
        assert_eq!(limiter.available_slots(), None);
    }
}
