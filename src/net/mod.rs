//! HTTP transport layer: ranged fetching, retry classification, and
//! per-domain rate limiting.

mod constants;
mod error;
mod fetcher;
pub mod rate_limiter;
mod retry;

pub use constants::{
    CONNECT_TIMEOUT_SECS, CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_REDIRECTS, MAX_RETRY_AFTER,
    READ_TIMEOUT_SECS,
};
pub use error::FetchError;
pub use fetcher::{FetchOutcome, HttpFetcher, ProbeResult};
pub use rate_limiter::RateLimiter;
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
