//! Engine error type.
//!
//! Only infrastructure failures live here. A single target failing to
//! respond is never an error; it is a [`ProbeOutcome`](crate::outcome::ProbeOutcome)
//! with `success = false`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("Model discovery failed (HTTP {status}): {message}")]
    Discovery { status: u16, message: String },

    #[error("Cache storage error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Probe worker failed: {0}")]
    Worker(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
