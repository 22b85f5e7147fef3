//! Engine configuration, loaded from YAML.
//!
//! Every tunable lives in one explicit structure. Missing keys fall back
//! to defaults, unknown keys are rejected, and [`EngineConfig::validate`]
//! runs before anything is constructed from it.
//!
//! Lookup order for the file: `$MODELPROBE_CONFIG`, then
//! `~/.modelprobe/config.yaml`, then built-in defaults. The environment
//! variables `MODELPROBE_API_KEY` and `MODELPROBE_BASE_URL` take precedence
//! over the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Longest accepted cache TTL: ten years.
pub const MAX_TTL_HOURS: u64 = 10 * 365 * 24;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub api: ApiConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub probe: ProbeConfig,
    pub output: OutputConfig,
    pub alerts: AlertConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    /// Deadline for a single attempt.
    pub timeout_secs: u64,
    /// Prompt sent to language models.
    pub test_message: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: String::new(),
            timeout_secs: 30,
            test_message: "hello".into(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Bounds and tuning for the adaptive concurrency controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencyConfig {
    pub initial_limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    /// Number of recent outcomes considered per evaluation.
    pub window_size: usize,
    /// Fractional growth applied on a healthy window (at least +1).
    pub growth_fraction: f64,
    /// Fractional shrink applied on an unhealthy window (at least -1).
    pub shrink_fraction: f64,
    pub high_success_threshold: f64,
    pub low_success_threshold: f64,
    pub low_latency_ms: u64,
    pub high_latency_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            initial_limit: 10,
            min_limit: 3,
            max_limit: 50,
            window_size: 20,
            growth_fraction: 0.3,
            shrink_fraction: 0.2,
            high_success_threshold: 0.95,
            low_success_threshold: 0.8,
            low_latency_ms: 2_000,
            high_latency_ms: 5_000,
        }
    }
}

/// How a single target is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Extra random delay, as a fraction of the computed delay.
    pub jitter_fraction: f64,
    /// Upper bound for any single backoff sleep.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// SQLite file. Defaults to `~/.modelprobe/cache.db`.
    pub path: Option<PathBuf>,
    pub ttl_hours: u64,
    /// Buffered writes committed together once this many are pending.
    pub buffer_size: usize,
    /// Skip targets whose failure streak reached this value. 0 disables.
    pub skip_threshold: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            ttl_hours: 24,
            buffer_size: 50,
            skip_threshold: 3,
        }
    }
}

impl CacheConfig {
    /// The TTL as a duration, clamped to [`MAX_TTL_HOURS`].
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours.min(MAX_TTL_HOURS) as i64)
    }

    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| data_dir().join("cache.db"))
    }
}

/// Which targets get probed, and how.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Only retest targets whose cached outcome is a failure. Needs the cache.
    pub only_failed: bool,
    // Capabilities skipped here get a cheap connectivity probe instead of
    // a full request.
    pub skip_vision: bool,
    pub skip_audio: bool,
    pub skip_embedding: bool,
    pub skip_image_generation: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Write the ordered outcomes here as JSON.
    pub json_path: Option<PathBuf>,
}

/// Post-run alert thresholds. An alert fires when a run crosses one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertConfig {
    pub min_success_rate: f64,
    pub max_avg_latency_ms: u64,
    pub max_rate_limited: usize,
    pub max_forbidden: usize,
    pub max_timeouts: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            min_success_rate: 0.5,
            max_avg_latency_ms: 5_000,
            max_rate_limited: 50,
            max_forbidden: 100,
            max_timeouts: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into(), format: "text".into() }
    }
}

/// `~/.modelprobe`, or `./.modelprobe` when no home directory is known.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelprobe")
}

impl EngineConfig {
    /// Resolve the config file, parse it, apply env overrides, validate.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var_os("MODELPROBE_CONFIG").map(PathBuf::from);
        let path = explicit.unwrap_or_else(|| data_dir().join("config.yaml"));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var("MODELPROBE_API_KEY") {
            if !key.is_empty() {
                config.api.api_key = key;
            }
        }
        if let Ok(url) = std::env::var("MODELPROBE_BASE_URL") {
            if !url.is_empty() {
                config.api.base_url = url;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Check every invariant and report all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let c = &self.concurrency;

        if c.min_limit < 1 {
            problems.push("concurrency.min_limit must be at least 1".to_string());
        }
        if c.min_limit > c.max_limit {
            problems.push(format!(
                "concurrency.min_limit ({}) exceeds max_limit ({})",
                c.min_limit, c.max_limit
            ));
        }
        if c.initial_limit < c.min_limit || c.initial_limit > c.max_limit {
            problems.push(format!(
                "concurrency.initial_limit ({}) must lie within [{}, {}]",
                c.initial_limit, c.min_limit, c.max_limit
            ));
        }
        if c.window_size < 1 {
            problems.push("concurrency.window_size must be at least 1".to_string());
        }
        for (name, v) in [("growth_fraction", c.growth_fraction), ("shrink_fraction", c.shrink_fraction)] {
            if !(v > 0.0 && v <= 1.0) {
                problems.push(format!("concurrency.{} must be in (0, 1], got {}", name, v));
            }
        }
        for (name, v) in [
            ("high_success_threshold", c.high_success_threshold),
            ("low_success_threshold", c.low_success_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                problems.push(format!("concurrency.{} must be in [0, 1], got {}", name, v));
            }
        }
        if c.low_success_threshold > c.high_success_threshold {
            problems.push("concurrency.low_success_threshold exceeds high_success_threshold".to_string());
        }
        if c.low_latency_ms > c.high_latency_ms {
            problems.push("concurrency.low_latency_ms exceeds high_latency_ms".to_string());
        }

        let r = &self.retry;
        if r.max_attempts < 1 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if !(r.backoff_multiplier >= 1.0) {
            problems.push(format!("retry.backoff_multiplier must be >= 1, got {}", r.backoff_multiplier));
        }
        if !(0.0..=1.0).contains(&r.jitter_fraction) {
            problems.push(format!("retry.jitter_fraction must be in [0, 1], got {}", r.jitter_fraction));
        }
        if r.max_delay_ms < r.base_delay_ms {
            problems.push("retry.max_delay_ms is smaller than base_delay_ms".to_string());
        }

        if self.cache.ttl_hours == 0 || self.cache.ttl_hours > MAX_TTL_HOURS {
            problems.push(format!(
                "cache.ttl_hours must be in [1, {}], got {}",
                MAX_TTL_HOURS, self.cache.ttl_hours
            ));
        }
        if self.cache.buffer_size < 1 {
            problems.push("cache.buffer_size must be at least 1".to_string());
        }

        if !(0.0..=1.0).contains(&self.alerts.min_success_rate) {
            problems.push(format!(
                "alerts.min_success_rate must be in [0, 1], got {}",
                self.alerts.min_success_rate
            ));
        }

        if self.probe.only_failed && !self.cache.enabled {
            problems.push("probe.only_failed requires cache.enabled".to_string());
        }

        if self.api.timeout_secs == 0 {
            problems.push("api.timeout_secs must be positive".to_string());
        }
        if self.api.base_url.trim().is_empty() {
            problems.push("api.base_url is empty".to_string());
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            problems.push(format!("logging.format must be `text` or `json`, got `{}`", self.logging.format));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig(problems))
        }
    }
}
