//! Persistent result cache: past outcomes plus per-target failure streaks.
//!
//! Successful outcomes are trusted until their TTL expires; failure
//! streaks survive expiry so persistently broken models can be skipped
//! across runs.

pub mod store;

pub use store::{CacheEntry, CacheStats, PersistentFailure, ResultCache};
