//! Fixed-window request quota shared by every gateway caller.
//!
//! One [`RateWindow`] exists per [`RateLimiter`]; admission checks and
//! increments happen under a single mutex, so concurrent callers can never
//! push the count past the limit. Over-quota calls fail fast with the time
//! remaining in the window. Nothing is queued.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::trace;

use crate::config::RateLimitConfig;

/// The shared counter: calls admitted since `window_start`.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    window_start: Instant,
    count: u32,
    limit: u32,
    window: Duration,
}

impl RateWindow {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            limit: config.limit,
            window: config.window,
        }
    }

    fn elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window
    }

    /// Admit one call at `now`, or report how long until the window resets.
    fn admit(&mut self, now: Instant) -> Result<(), Duration> {
        if self.elapsed(now) {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.limit {
            let reset_at = self.window_start + self.window;
            return Err(reset_at.saturating_duration_since(now));
        }
        self.count += 1;
        Ok(())
    }
}

/// Point-in-time view of the quota, for logging and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateSnapshot {
    pub used: u32,
    pub limit: u32,
    /// Time until the current window resets.
    pub resets_in: Duration,
}

/// Serialized admission control over one [`RateWindow`].
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<RateWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            window: Mutex::new(RateWindow::new(config, Instant::now())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateWindow> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take one unit of quota. `Err` carries the wait until the window resets.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut window = self.lock();
        let outcome = window.admit(now);
        trace!(
            "Rate window: {}/{} used, admitted={}",
            window.count,
            window.limit,
            outcome.is_ok()
        );
        outcome
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let now = Instant::now();
        let window = self.lock();
        if window.elapsed(now) {
            return RateSnapshot {
                used: 0,
                limit: window.limit,
                resets_in: Duration::ZERO,
            };
        }
        RateSnapshot {
            used: window.count,
            limit: window.limit,
            resets_in: (window.window_start + window.window).saturating_duration_since(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(limit: u32, secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new(limit, Duration::from_secs(secs)))
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_then_reports_wait() {
        let limiter = limiter(3, 60);
        for _ in 0..3 {
            limiter.try_acquire().unwrap();
        }

        tokio::time::advance(Duration::from_secs(20)).await;
        let wait = limiter.try_acquire().unwrap_err();
        assert_eq!(wait, Duration::from_secs(40));
        assert_eq!(limiter.snapshot().used, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_elapsing() {
        let limiter = limiter(1, 10);
        limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.snapshot().used, 0);
        limiter.try_acquire().unwrap();
        assert_eq!(limiter.snapshot().used, 1);
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let limiter = limiter(0, 60);
        let start = Instant::now();
        let wait = limiter.try_acquire_at(start).unwrap_err();
        assert!(wait <= Duration::from_secs(60));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_exceed_limit() {
        let limiter = Arc::new(limiter(25, 3600));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                (0..10).filter(|_| limiter.try_acquire().is_ok()).count()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap();
        }
        assert_eq!(admitted, 25);
    }
}
