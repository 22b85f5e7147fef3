//! Attempt classifier: maps a raw attempt onto the closed set of
//! verdicts the retry executor acts on.
//!
//! The rules are a keyword fast-path over the status and body text, the
//! same way provider error pages are usually recognised.

use crate::adapters::RawAttempt;
use crate::outcome::Classification;

/// Strategy that turns a raw attempt into a [`Classification`].
pub trait Classify: Send + Sync {
    fn classify(&self, attempt: &RawAttempt) -> Classification;
}

/// Body fragments that mean throttling even without a 429.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "resource_exhausted",
    "too many requests",
    "quota exceeded",
];

/// Default rules for OpenAI-compatible HTTP APIs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpClassifier;

impl Classify for HttpClassifier {
    fn classify(&self, attempt: &RawAttempt) -> Classification {
        // Timeouts, refused connections, broken requests
        let Some(status) = attempt.status.filter(|_| attempt.failure.is_none()) else {
            return Classification::Transient;
        };

        // ── 2xx ──
        if (200..300).contains(&status) {
            return if attempt.content_ok {
                Classification::Success
            } else {
                Classification::Fatal
            };
        }

        // ── Throttling ──
        if status == 429 || mentions_rate_limit(&attempt.snippet) {
            return Classification::RateLimited;
        }

        // ── Server-side trouble ──
        if status == 408 || (500..600).contains(&status) {
            return Classification::Transient;
        }

        Classification::Fatal
    }
}

fn mentions_rate_limit(body: &str) -> bool {
    let lower = body.to_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}
