use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Maximum retry attempts after an initial request attempt.
pub const MAX_RETRIES: u32 = 2;
/// Base delay before the first retry.
pub const BASE_DELAY_MS: u64 = 1000;
/// Upper bound for a single backoff sleep.
pub const MAX_DELAY_MS: u64 = 8000;

fn retryable_error_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(
            r"(?i)rate.?limit|overloaded|resource.?exhausted|service.?unavailable|temporarily unavailable|upstream.?connect|connection.?(refused|reset)",
        )
        .expect("retry regex must compile")
    })
}

/// Retry policy for transient failures and retryable statuses.
pub fn is_retryable_http_error(status: u16, error_text: &str) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504 | 529)
        || retryable_error_regex().is_match(error_text)
}

/// Exponential backoff delay for a retry attempt, capped at [`MAX_DELAY_MS`].
pub fn retry_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(16);
    let millis = BASE_DELAY_MS.saturating_mul(2u64.saturating_pow(exponent));
    Duration::from_millis(millis.min(MAX_DELAY_MS))
}
