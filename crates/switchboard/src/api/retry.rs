//! Exponential backoff for transient gateway failures.
//!
//! Retries upstream overload (529), upstream rate limiting (429), upstream
//! unavailability (503), request timeouts and network send failures. Every
//! other failure is terminal and returned on the spot without spending the
//! remaining retry budget.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::GatewayError;

/// Statuses worth another attempt.
pub const RETRYABLE_STATUSES: [u16; 3] = [429, 503, 529];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP-date.
///
/// Dates in the past yield a zero wait.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (0-indexed): `base_delay * 2^attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Wait before retrying after `error`. A server `Retry-After` hint wins
    /// over the computed backoff, capped at `max_retry_after`.
    pub fn delay_after(&self, attempt: u32, error: &GatewayError) -> Duration {
        match error.retry_after() {
            Some(hint) => hint.min(self.max_retry_after),
            None => self.delay_for_attempt(attempt),
        }
    }
}

/// Run `call` until it succeeds, fails terminally, or the retry budget is
/// spent. `call` receives the 1-based attempt number. On success, returns
/// the value and the number of attempts it took.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    endpoint: &str,
    mut call: F,
) -> Result<(T, u32), GatewayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;
    loop {
        match call(attempt + 1).await {
            Ok(value) => return Ok((value, attempt + 1)),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.delay_after(attempt, &e);
                warn!(
                    "Transient gateway error (attempt {}/{}): {e}. Retrying in {delay:?}...",
                    attempt + 1,
                    policy.max_retries + 1,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if attempt == 0 => return Err(e),
            Err(e) => {
                return Err(GatewayError::RetriesExhausted {
                    endpoint: endpoint.to_string(),
                    attempts: attempt + 1,
                    last: Box::new(e),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn upstream(status: u16, retry_after: Option<Duration>) -> GatewayError {
        GatewayError::Upstream {
            endpoint: "sales".into(),
            status,
            attempt: 1,
            body: String::new(),
            retry_after,
        }
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(529));
        for status in [400, 401, 404, 500, 502] {
            assert!(!is_retryable_status(status), "{status}");
        }
    }

    #[test]
    fn delay_doubles_from_base() {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let policy = RetryPolicy::default();
        let hinted = upstream(429, Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_after(2, &hinted), Duration::from_secs(5));

        let greedy = upstream(429, Some(Duration::from_secs(3600)));
        assert_eq!(policy.delay_after(0, &greedy), policy.max_retry_after);

        let plain = upstream(503, None);
        assert_eq!(policy.delay_after(1, &plain), Duration::from_secs(2));
    }

    #[test]
    fn parses_retry_after_forms() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 30).unwrap();
        assert_eq!(parse_retry_after(" 120 ", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<((), u32), _> = retry_with_backoff(&policy, "sales", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(upstream(404, None)) }
        })
        .await;

        assert_eq!(result.unwrap_err().status(), Some(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let policy = RetryPolicy::default();
        let started = tokio::time::Instant::now();
        let (value, attempts) = retry_with_backoff(&policy, "sales", |attempt| async move {
            if attempt < 3 {
                Err(upstream(529, None))
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(attempts, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_error() {
        let policy = RetryPolicy::default().with_max_retries(2);
        let result: Result<((), u32), _> =
            retry_with_backoff(&policy, "sales", |attempt| async move {
                Err(GatewayError::Upstream {
                    endpoint: "sales".into(),
                    status: 503,
                    attempt,
                    body: "down".into(),
                    retry_after: None,
                })
            })
            .await;

        match result.unwrap_err() {
            GatewayError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, GatewayError::Upstream { attempt: 3, .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
