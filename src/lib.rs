//! modelprobe: availability and latency probing for large fleets of
//! LLM-serving API models.
//!
//! The engine decides when, how many at once, and whether at all a model
//! gets probed:
//! - [`pool::Dispatcher`] fans targets out over an adaptive worker pool
//! - [`pool::ConcurrencyController`] tunes the pool size from recent outcomes
//! - [`pool::RetryExecutor`] retries transient and throttled attempts
//! - [`cache::ResultCache`] remembers outcomes and failure streaks across runs

pub mod adapters;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod outcome;
pub mod pool;
pub mod report;

pub use error::{EngineError, Result};
