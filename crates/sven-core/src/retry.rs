// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Maximum retry attempts before a transient error is treated as fatal.
pub const MAX_ATTEMPTS: u32 = 10;

const BASE_DELAY_SECS: u64 = 2;
const MAX_DELAY_SECS: u64 = 30;

/// Substrings that mark an error as retryable, with the user-facing label
/// shown while retrying.
const RETRYABLE_PATTERNS: &[(&[&str], &str)] = &[
    (&["rate_limit", "too_many_requests", "429"], "Rate Limited"),
    (&["overloaded", "unavailable", "exhausted"], "Provider is overloaded"),
    (&["502", "503", "529"], "Server error - retrying"),
    (&["connection refused", "connection reset", "timeout", "timed out"], "Connection error"),
];

/// Substrings that mark an error as a non-retryable context-overflow —
/// checked before the retryable table so an overflow error never gets
/// retried even if it also contains a superficially-retryable substring.
const OVERFLOW_PATTERNS: &[&str] = &[
    "context_length_exceeded",
    "token limit",
    "context window",
    "maximum context length",
    "content_too_large",
    "prompt is too long",
    "request too large",
    "input is too long",
    "exceeds the model's maximum",
];

/// Extra headers a provider error may carry, used to compute an exact
/// backoff delay instead of the exponential default.
#[derive(Debug, Clone, Default)]
pub struct RetryHeaders {
    pub retry_after_ms: Option<u64>,
    pub retry_after: Option<String>,
}

/// Classify an error message. Returns the user-facing retry label when the
/// error is retryable, `None` when it is not (including all overflow errors).
pub fn is_retryable(error_message: &str) -> Option<&'static str> {
    let lower = error_message.to_lowercase();
    if OVERFLOW_PATTERNS.iter().any(|p| lower.contains(p)) {
        return None;
    }
    for (substrings, label) in RETRYABLE_PATTERNS {
        if substrings.iter().any(|s| lower.contains(s)) {
            return Some(label);
        }
    }
    None
}

/// Compute the delay before the next retry attempt (1-indexed `attempt`).
///
/// Precedence: `Retry-After-Ms` header, then `Retry-After` (seconds or
/// HTTP-date), then exponential backoff capped at 30s (the cap only applies
/// when no headers were provided at all).
pub fn compute_delay(attempt: u32, headers: Option<&RetryHeaders>) -> Duration {
    if let Some(h) = headers {
        if let Some(ms) = h.retry_after_ms {
            return Duration::from_millis(ms);
        }
        if let Some(ra) = &h.retry_after {
            if let Ok(secs) = ra.parse::<u64>() {
                return Duration::from_secs(secs);
            }
            if let Ok(when) = DateTime::parse_from_rfc2822(ra) {
                let when: DateTime<Utc> = when.into();
                let now = Utc::now();
                if when > now {
                    return (when - now).to_std().unwrap_or_default();
                }
            }
        }
    }
    let attempt = attempt.max(1);
    let secs = BASE_DELAY_SECS.saturating_mul(1u64 << (attempt - 1).min(10));
    Duration::from_secs(secs.min(MAX_DELAY_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_retryable() {
        assert_eq!(is_retryable("429 too_many_requests"), Some("Rate Limited"));
    }

    #[test]
    fn overloaded_is_retryable() {
        assert_eq!(is_retryable("model is overloaded, try again"), Some("Provider is overloaded"));
    }

    #[test]
    fn server_error_codes_are_retryable() {
        assert_eq!(is_retryable("HTTP 503 Service Unavailable"), Some("Server error - retrying"));
    }

    #[test]
    fn connection_errors_are_retryable() {
        assert_eq!(is_retryable("connection refused"), Some("Connection error"));
    }

    #[test]
    fn context_overflow_is_not_retryable_even_with_429() {
        assert_eq!(is_retryable("429: context_length_exceeded"), None);
    }

    #[test]
    fn unrelated_error_is_not_retryable() {
        assert_eq!(is_retryable("invalid api key"), None);
    }

    #[test]
    fn retry_after_ms_header_wins() {
        let h = RetryHeaders { retry_after_ms: Some(250), retry_after: Some("10".into()) };
        assert_eq!(compute_delay(1, Some(&h)), Duration::from_millis(250));
    }

    #[test]
    fn retry_after_seconds_header_used_when_no_ms() {
        let h = RetryHeaders { retry_after_ms: None, retry_after: Some("5".into()) };
        assert_eq!(compute_delay(1, Some(&h)), Duration::from_secs(5));
    }

    #[test]
    fn exponential_backoff_without_headers() {
        assert_eq!(compute_delay(1, None), Duration::from_secs(2));
        assert_eq!(compute_delay(2, None), Duration::from_secs(4));
        assert_eq!(compute_delay(3, None), Duration::from_secs(8));
    }

    #[test]
    fn exponential_backoff_caps_at_30s() {
        assert_eq!(compute_delay(10, None), Duration::from_secs(30));
    }

    #[test]
    fn delay_is_monotonic_without_headers() {
        let mut prev = Duration::from_secs(0);
        for attempt in 1..=MAX_ATTEMPTS {
            let d = compute_delay(attempt, None);
            assert!(d >= prev);
            prev = d;
        }
    }
}
