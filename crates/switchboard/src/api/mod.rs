//! Remote business API access.
//!
//! - [`gateway`]: [`RetryingHttpGateway`], the only path to the remote API:
//!   URL and credential assembly, per-attempt timeout, response
//!   classification.
//! - [`rate_limit`]: the process-wide fixed-window quota ([`RateLimiter`]).
//! - [`retry`]: retryable status classification, `Retry-After` parsing and
//!   the exponential backoff loop.

pub mod gateway;
pub mod rate_limit;
pub mod retry;

pub use gateway::{HttpResponse, HttpTransport, QueryParams, ReqwestTransport, RetryingHttpGateway};
pub use rate_limit::{RateLimiter, RateSnapshot, RateWindow};
pub use retry::{is_retryable_status, parse_retry_after};
