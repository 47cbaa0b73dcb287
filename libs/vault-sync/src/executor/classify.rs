//! Rate-limit classification for provider errors.
//!
//! Providers signal quota exhaustion in different ways: HTTP 429, JSON-RPC
//! error codes, or free-text messages. Some of them add a hint telling the
//! caller how long to back off.

use std::time::Duration;

/// Returned by a classifier when a failure should be treated as a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimitSignal {
    /// Provider-supplied wait, overrides the computed backoff when present
    pub retry_after: Option<Duration>,
}

/// Implemented by error types that flow through the request executor.
pub trait RetryClassify {
    /// `Some` when this failure is a rate limit and should be retried with backoff.
    fn rate_limit_signal(&self) -> Option<RateLimitSignal>;
}

/// Status codes and JSON-RPC codes used by common node providers for quota errors.
const RATE_LIMIT_CODES: &[&str] = &["429", "-32005", "-32029", "-32090"];

const RATE_LIMIT_PHRASES: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "request limit",
    "exceeded the quota",
    "quota exceeded",
    "compute units per second",
    "throughput",
    "throttl",
];

/// Classify an error message, returning a signal when it describes a rate limit.
///
/// A retry hint alone (e.g. "retry after 2s") is enough to classify a message.
pub fn classify_rate_limit(message: &str) -> Option<RateLimitSignal> {
    let lower = message.to_lowercase();
    let retry_after = parse_retry_hint(&lower);

    let coded = RATE_LIMIT_CODES.iter().any(|code| contains_code(&lower, code));
    let phrased = RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p));

    if coded || phrased || retry_after.is_some() {
        Some(RateLimitSignal { retry_after })
    } else {
        None
    }
}

/// Whether `code` appears as a standalone token, so "429" matches
/// "status 429" or `"code":429` but not block 14290001 or a hex hash.
fn contains_code(message: &str, code: &str) -> bool {
    let bytes = message.as_bytes();
    message.match_indices(code).any(|(start, _)| {
        let end = start + code.len();
        let before_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
        let after_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        before_ok && after_ok
    })
}

/// Extract a wait hint such as "retry after 3s", "try again in 500ms" or
/// "retry-after: 2" (seconds when no unit is given).
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    let lower = message.to_lowercase();
    const MARKERS: &[&str] = &["retry after", "retry-after:", "retry-after", "try again in"];

    for marker in MARKERS {
        let Some(pos) = lower.find(marker) else {
            continue;
        };
        let rest = lower[pos + marker.len()..].trim_start();

        let digits: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if digits.is_empty() {
            continue;
        }
        let value: f64 = match digits.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let unit = rest[digits.len()..].trim_start();

        let millis = if unit.starts_with("ms") || unit.starts_with("millisecond") {
            value
        } else {
            value * 1000.0
        };
        return Some(Duration::from_millis(millis.round() as u64));
    }

    None
}
