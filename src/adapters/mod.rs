//! Probe adapters: provider-facing code that performs one raw attempt.
//!
//! A [`Prober`] sends a single request for a target and reports what came
//! back. It never retries and never decides whether the attempt counts as
//! success; that is the classifier's job.

use async_trait::async_trait;
use std::time::Duration;

use crate::outcome::ProbeTarget;

pub mod openai;

/// Longest snippet kept from any response body.
pub const SNIPPET_MAX_CHARS: usize = 200;

// ── Raw Attempt ─────────────────────────────────────────────────────

/// Why a request never produced an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout,
    Connect,
    Other,
}

/// Unclassified result of one network attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAttempt {
    pub status: Option<u16>,
    pub failure: Option<TransportFailure>,
    pub latency_ms: u64,
    /// Assistant text on success, error message otherwise.
    pub snippet: String,
    /// Whether a 2xx body carried usable content.
    pub content_ok: bool,
    /// Server-provided `Retry-After` hint.
    pub retry_after: Option<Duration>,
}

impl RawAttempt {
    pub fn http(status: u16, latency_ms: u64, snippet: impl Into<String>, content_ok: bool) -> Self {
        Self {
            status: Some(status),
            failure: None,
            latency_ms,
            snippet: snippet.into(),
            content_ok,
            retry_after: None,
        }
    }

    pub fn transport(failure: TransportFailure, latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            status: None,
            failure: Some(failure),
            latency_ms,
            snippet: message.into(),
            content_ok: false,
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_http_success(&self) -> bool {
        matches!(self.status, Some(s) if (200..300).contains(&s))
    }

    /// Short machine code for the attempt. Empty for a good 2xx.
    pub fn error_code(&self) -> String {
        match (self.failure, self.status) {
            (Some(TransportFailure::Timeout), _) => "TIMEOUT".into(),
            (Some(TransportFailure::Connect), _) => "CONN_FAILED".into(),
            (Some(TransportFailure::Other), _) | (None, None) => "REQUEST_FAILED".into(),
            (None, Some(_)) if self.is_http_success() && self.content_ok => String::new(),
            (None, Some(_)) if self.is_http_success() => "NO_CONTENT".into(),
            (None, Some(status)) => format!("HTTP_{}", status),
        }
    }
}

// ── Prober Trait ────────────────────────────────────────────────────

/// Performs one attempt against one target.
///
/// Implementations must not panic on provider errors: every failure is
/// reported through the returned [`RawAttempt`].
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> RawAttempt;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(RawAttempt::http(200, 10, "hi", true).error_code(), "");
        assert_eq!(RawAttempt::http(200, 10, "", false).error_code(), "NO_CONTENT");
        assert_eq!(RawAttempt::http(404, 10, "not found", false).error_code(), "HTTP_404");
        assert_eq!(RawAttempt::http(429, 10, "", false).error_code(), "HTTP_429");
        assert_eq!(
            RawAttempt::transport(TransportFailure::Timeout, 30_000, "timed out").error_code(),
            "TIMEOUT"
        );
        assert_eq!(
            RawAttempt::transport(TransportFailure::Connect, 5, "refused").error_code(),
            "CONN_FAILED"
        );
        assert_eq!(
            RawAttempt::transport(TransportFailure::Other, 5, "bad").error_code(),
            "REQUEST_FAILED"
        );
    }
}
