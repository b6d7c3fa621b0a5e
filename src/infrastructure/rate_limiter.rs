//! Per-origin request pacing
//!
//! [`OriginRateLimiter`] is a keyed GCRA token bucket: every origin gets its
//! own bucket, so the request rate against one marketplace host stays capped
//! no matter how many workers are running. Permits are not held; a worker
//! waits until its origin is ready and then proceeds.
//!
//! [`OriginBackoff`] layers pause windows on top: after a rate-limited
//! response the origin is paused for the backoff delay while other origins
//! keep flowing.
//!
//! [`OriginGate`] bundles both. Every render against a marketplace, whether
//! a fetch attempt, a challenge retry or a re-login, passes the same gate.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::marketplace::Origin;
use crate::infrastructure::config::RateLimitConfig;

pub struct OriginRateLimiter {
    limiter: DefaultKeyedRateLimiter<Origin>,
    requests_per_second: NonZeroU32,
}

impl OriginRateLimiter {
    #[must_use]
    pub fn new(requests_per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_second(requests_per_second).allow_burst(burst);
        Self {
            limiter: RateLimiter::keyed(quota),
            requests_per_second,
        }
    }

    /// `None` when the config carries a zero rate or burst.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        Some(Self::new(
            NonZeroU32::new(config.requests_per_second)?,
            NonZeroU32::new(config.burst)?,
        ))
    }

    /// Waits until `origin` may issue another request.
    pub async fn acquire(&self, origin: &Origin) {
        self.limiter.until_key_ready(origin).await;
        debug!("🎫 Rate permit granted for {} ({} rps)", origin, self.requests_per_second);
    }

    /// Non-blocking variant, `true` if a request may go out now.
    #[must_use]
    pub fn try_acquire(&self, origin: &Origin) -> bool {
        self.limiter.check_key(origin).is_ok()
    }
}

/// Longest pause a single response can impose on an origin.
pub const MAX_PAUSE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct PauseWindow {
    until: Instant,
}

/// Origin-local pause windows set by rate-limited responses.
#[derive(Debug, Default)]
pub struct OriginBackoff {
    windows: Mutex<HashMap<Origin, PauseWindow>>,
}

impl OriginBackoff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pauses `origin` for at least `delay` (at most [`MAX_PAUSE`]); an
    /// existing longer pause wins.
    pub fn pause(&self, origin: &Origin, delay: Duration) {
        let now = Instant::now();
        let until = now
            .checked_add(delay.min(MAX_PAUSE))
            .unwrap_or(now);
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = windows.entry(origin.clone()).or_insert(PauseWindow { until });
        if entry.until < until {
            entry.until = until;
        }
    }

    /// Remaining pause for `origin`, `None` when it may proceed.
    #[must_use]
    pub fn remaining(&self, origin: &Origin) -> Option<Duration> {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.get(origin)?;
        let now = Instant::now();
        (window.until > now).then(|| window.until - now)
    }

    /// Sleeps through the origin's pause window, re-checking in case it was
    /// extended meanwhile.
    pub async fn wait(&self, origin: &Origin) {
        while let Some(remaining) = self.remaining(origin) {
            debug!("⏸️ {} paused for another {:?}", origin, remaining);
            tokio::time::sleep(remaining).await;
        }
    }

}

/// Pause windows plus rate permits, shared by everything that renders.
pub struct OriginGate {
    limiter: Option<OriginRateLimiter>,
    backoff: OriginBackoff,
}

impl OriginGate {
    #[must_use]
    pub fn new(limiter: Option<OriginRateLimiter>) -> Self {
        Self {
            limiter,
            backoff: OriginBackoff::new(),
        }
    }

    /// A gate that only enforces pause windows.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let limiter = OriginRateLimiter::from_config(config);
        if limiter.is_none() {
            warn!("Rate limiting disabled: requests_per_second and burst must be non-zero");
        }
        Self::new(limiter)
    }

    #[must_use]
    pub const fn backoff(&self) -> &OriginBackoff {
        &self.backoff
    }

    /// Waits out the pause window of `origin`, then takes a rate permit.
    pub async fn admit(&self, origin: &Origin) {
        self.backoff.wait(origin).await;
        if let Some(limiter) = &self.limiter {
            limiter.acquire(origin).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    fn origin(raw: &str) -> Origin {
        Origin::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_keyed_limiter_spaces_requests_per_origin() {
        let limiter = OriginRateLimiter::new(NonZeroU32::new(20).unwrap(), NonZeroU32::new(1).unwrap());
        let a = origin("https://detail.1688.com");

        let start = StdInstant::now();
        for _ in 0..5 {
            limiter.acquire(&a).await;
        }
        // 5 permits at 20/s with burst 1: four 50ms gaps.
        assert!(start.elapsed() >= Duration::from_millis(160));
    }

    #[tokio::test]
    async fn test_origins_have_independent_buckets() {
        let limiter = OriginRateLimiter::new(NonZeroU32::new(1).unwrap(), NonZeroU32::new(1).unwrap());
        let a = origin("https://detail.1688.com");
        let b = origin("https://item.taobao.com");

        assert!(limiter.try_acquire(&a));
        assert!(!limiter.try_acquire(&a));
        assert!(limiter.try_acquire(&b));
    }

    #[test]
    fn test_from_config_rejects_zero_rate() {
        let config = RateLimitConfig {
            requests_per_second: 0,
            burst: 1,
        };
        assert!(OriginRateLimiter::from_config(&config).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_pause_is_capped() {
        let backoff = OriginBackoff::new();
        let a = origin("https://item.taobao.com");

        backoff.pause(&a, Duration::MAX);
        let remaining = backoff.remaining(&a).unwrap();
        assert!(remaining <= MAX_PAUSE);
        assert!(remaining > MAX_PAUSE - Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_gate_spaces_renders_and_honours_pauses() {
        let gate = OriginGate::new(Some(OriginRateLimiter::new(
            NonZeroU32::new(10).unwrap(),
            NonZeroU32::new(1).unwrap(),
        )));
        let a = origin("https://item.taobao.com");

        let start = StdInstant::now();
        gate.admit(&a).await;
        gate.admit(&a).await;
        assert!(start.elapsed() >= Duration::from_millis(90));

        gate.backoff().pause(&a, Duration::from_millis(150));
        let paused = StdInstant::now();
        gate.admit(&a).await;
        assert!(paused.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_local_to_origin() {
        let backoff = OriginBackoff::new();
        let a = origin("https://detail.1688.com");
        let b = origin("https://item.taobao.com");

        backoff.pause(&a, Duration::from_secs(30));
        assert!(backoff.remaining(&a).is_some());
        assert!(backoff.remaining(&b).is_none());

        backoff.pause(&a, Duration::from_secs(5));
        assert!(backoff.remaining(&a).unwrap() > Duration::from_secs(20));

        let before = Instant::now();
        backoff.wait(&a).await;
        assert!(before.elapsed() >= Duration::from_secs(30));
        assert!(backoff.remaining(&a).is_none());
    }
}
