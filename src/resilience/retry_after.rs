//! Server-suggested wait extraction.
//!
//! Providers phrase retry hints inconsistently, sometimes only in the error
//! body. Message patterns are tried first, then the `Retry-After` header.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use super::classify::Failure;

static RETRY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)retry after (\d+) seconds?",
        r"(?i)please retry after (\d+)",
        r"(?i)retry-after[:\s]+(\d+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Best-effort retry-after hint. Never fails; unparseable values yield `None`.
pub fn extract_retry_after<F: Failure + ?Sized>(error: &F) -> Option<Duration> {
    let message = error.to_string();
    for pattern in RETRY_PATTERNS.iter() {
        if let Some(secs) = pattern
            .captures(&message)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
        {
            return Some(Duration::from_secs(secs));
        }
    }

    error.retry_after_header().and_then(parse_header_seconds)
}

/// Only the delta-seconds form is understood; HTTP-dates are ignored.
fn parse_header_seconds(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}
