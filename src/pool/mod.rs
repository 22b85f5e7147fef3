//! Probe pool: how many probes run at once, how each one is retried,
//! and how a whole target list is fanned out and collected.

pub mod classifier;
pub mod concurrency;
pub mod dispatcher;
pub mod retry;

pub use classifier::{Classify, HttpClassifier};
pub use concurrency::{ConcurrencyController, ConcurrencySnapshot};
pub use dispatcher::Dispatcher;
pub use retry::{AttemptReport, RetryExecutor};
