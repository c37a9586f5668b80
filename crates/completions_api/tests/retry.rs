use completions_api::retry::*;

#[test]
fn retry_http_status_is_retryable() {
    for status in [408, 429, 500, 502, 503, 504, 529] {
        assert!(is_retryable_http_error(status, ""), "{status}");
    }
    assert!(!is_retryable_http_error(400, ""));
    assert!(!is_retryable_http_error(401, ""));
}

#[test]
fn retry_http_error_pattern_is_retryable() {
    assert!(is_retryable_http_error(400, "rate limit exceeded"));
    assert!(is_retryable_http_error(400, "RESOURCE_EXHAUSTED"));
    assert!(is_retryable_http_error(400, "connection refused"));
}

#[test]
fn retry_delay_is_exponential_and_capped() {
    assert_eq!(retry_delay(0).as_millis(), 1000);
    assert_eq!(retry_delay(1).as_millis(), 2000);
    assert_eq!(retry_delay(2).as_millis(), 4000);
    assert_eq!(retry_delay(10).as_millis(), u128::from(MAX_DELAY_MS));
}
