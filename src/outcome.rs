//! Core data model: what gets probed and what comes back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Targets ─────────────────────────────────────────────────────────

/// What kind of endpoint a model exposes. Decides which request the
/// prober sends; the engine itself treats it as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Language,
    Vision,
    Audio,
    Embedding,
    ImageGeneration,
    Reranker,
    Moderation,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Language => "language",
            Capability::Vision => "vision",
            Capability::Audio => "audio",
            Capability::Embedding => "embedding",
            Capability::ImageGeneration => "image_generation",
            Capability::Reranker => "reranker",
            Capability::Moderation => "moderation",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One model to probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub id: String,
    pub capability: Capability,
}

impl ProbeTarget {
    pub fn new(id: impl Into<String>, capability: Capability) -> Self {
        Self { id: id.into(), capability }
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Verdict on a single raw attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    /// Timeouts, connection resets, 5xx. Retryable.
    Transient,
    /// 429 or provider throttling. Retryable, contracts concurrency.
    RateLimited,
    /// Auth failures, bad requests, unknown models. Never retried.
    Fatal,
}

impl Classification {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Classification::Transient | Classification::RateLimited)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Classification::Success => None,
            Classification::Transient => Some(ErrorKind::Transient),
            Classification::RateLimited => Some(ErrorKind::RateLimited),
            Classification::Fatal => Some(ErrorKind::Fatal),
        }
    }
}

/// Failure category carried on a failed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimited,
    Fatal,
    /// The run was cancelled before this target finished.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(ErrorKind::Transient),
            "rate_limited" => Some(ErrorKind::RateLimited),
            "fatal" => Some(ErrorKind::Fatal),
            "cancelled" => Some(ErrorKind::Cancelled),
            _ => None,
        }
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Where an outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeOrigin {
    /// Freshly probed over the network in this run.
    Probed,
    /// Served from a non-expired successful cache entry.
    Cached,
    /// Not probed because the failure streak reached the skip threshold.
    Skipped,
    /// The run was cancelled before or during the probe.
    Cancelled,
}

/// Classified result of one probe. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub target_id: String,
    pub success: bool,
    pub latency_ms: u64,
    pub error_kind: Option<ErrorKind>,
    /// Short machine code: `HTTP_404`, `TIMEOUT`, `CONN_FAILED`, ...
    /// Empty on success.
    pub error_code: String,
    pub response_snippet: String,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
    pub origin: OutcomeOrigin,
}

impl ProbeOutcome {
    /// Outcome for a target the run never got to finish.
    pub fn cancelled(target_id: &str, attempts: u32) -> Self {
        Self {
            target_id: target_id.to_string(),
            success: false,
            latency_ms: 0,
            error_kind: Some(ErrorKind::Cancelled),
            error_code: "CANCELLED".into(),
            response_snippet: String::new(),
            timestamp: Utc::now(),
            attempts,
            origin: OutcomeOrigin::Cancelled,
        }
    }

    /// Same outcome, re-labelled with a different origin.
    pub fn with_origin(mut self, origin: OutcomeOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn is_rate_limited(&self) -> bool {
        self.error_kind == Some(ErrorKind::RateLimited)
    }
}

/// An outcome tagged with the input position it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedOutcome {
    pub index: usize,
    pub outcome: ProbeOutcome,
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
