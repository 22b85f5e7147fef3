//! Adaptive concurrency controller.
//!
//! Keeps a sliding window of recent probe summaries and moves the active
//! limit inside `[min_limit, max_limit]`. A rate-limited probe halves the
//! limit at once; everything else waits for a full window.
//!
//! Every change is published on a `watch` channel so idle workers wake up
//! as soon as the limit grows.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ConcurrencyConfig;
use crate::outcome::ProbeOutcome;

/// What the window remembers about one completed probe.
#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    latency_ms: u64,
    rate_limited: bool,
}

struct ConcurrencyState {
    current_limit: usize,
    window: VecDeque<Sample>,
    /// Records since the last windowed evaluation.
    since_eval: usize,
    total_recorded: u64,
    increases: u64,
    decreases: u64,
    rate_limit_events: u64,
}

impl ConcurrencyState {
    fn success_rate(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let ok = self.window.iter().filter(|s| s.success).count();
        Some(ok as f64 / self.window.len() as f64)
    }

    /// Mean latency of the successful samples; 0 when there are none.
    fn avg_success_latency_ms(&self) -> f64 {
        let (sum, n) = self
            .window
            .iter()
            .filter(|s| s.success)
            .fold((0u64, 0u64), |(sum, n), s| (sum + s.latency_ms, n + 1));
        if n == 0 {
            0.0
        } else {
            sum as f64 / n as f64
        }
    }
}

/// Point-in-time view of the controller for logging.
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencySnapshot {
    pub current_limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    pub window_fill: usize,
    pub window_size: usize,
    pub success_rate: Option<f64>,
    pub avg_latency_ms: f64,
    pub rate_limited_in_window: usize,
    pub increases: u64,
    pub decreases: u64,
    pub rate_limit_events: u64,
    pub total_recorded: u64,
}

pub struct ConcurrencyController {
    config: ConcurrencyConfig,
    state: Mutex<ConcurrencyState>,
    limit_tx: watch::Sender<usize>,
}

impl ConcurrencyController {
    /// Build a controller from a validated config. The initial limit is
    /// clamped into `[min_limit, max_limit]`.
    pub fn new(config: &ConcurrencyConfig) -> Self {
        let initial = config.initial_limit.clamp(config.min_limit, config.max_limit.max(config.min_limit));
        let (limit_tx, _) = watch::channel(initial);
        Self {
            config: config.clone(),
            state: Mutex::new(ConcurrencyState {
                current_limit: initial,
                window: VecDeque::with_capacity(config.window_size),
                since_eval: 0,
                total_recorded: 0,
                increases: 0,
                decreases: 0,
                rate_limit_events: 0,
            }),
            limit_tx,
        }
    }

    pub fn current_limit(&self) -> usize {
        self.lock().current_limit
    }

    pub fn min_limit(&self) -> usize {
        self.config.min_limit
    }

    pub fn max_limit(&self) -> usize {
        self.config.max_limit
    }

    /// Receiver that observes every limit change.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.limit_tx.subscribe()
    }

    /// Ingest one completed probe. Returns the limit afterwards.
    pub fn record(&self, outcome: &ProbeOutcome, rate_limited: bool) -> usize {
        let mut state = self.lock();
        let before = state.current_limit;

        if rate_limited {
            state.rate_limit_events += 1;
            let halved = (state.current_limit / 2).max(self.config.min_limit);
            if halved < state.current_limit {
                state.current_limit = halved;
                state.decreases += 1;
                info!(
                    target_id = %outcome.target_id,
                    from = before,
                    to = halved,
                    "🚦 Rate limited, halving concurrency"
                );
            }
        }

        state.window.push_back(Sample {
            success: outcome.success,
            latency_ms: outcome.latency_ms,
            rate_limited,
        });
        while state.window.len() > self.config.window_size {
            state.window.pop_front();
        }
        state.total_recorded += 1;
        state.since_eval += 1;

        if state.since_eval >= self.config.window_size && state.window.len() >= self.config.window_size {
            state.since_eval = 0;
            self.evaluate(&mut state);
        }

        let after = state.current_limit;
        debug_assert!(after >= self.config.min_limit && after <= self.config.max_limit);
        if after != before {
            self.limit_tx.send_replace(after);
        }
        after
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        let state = self.lock();
        ConcurrencySnapshot {
            current_limit: state.current_limit,
            min_limit: self.config.min_limit,
            max_limit: self.config.max_limit,
            window_fill: state.window.len(),
            window_size: self.config.window_size,
            success_rate: state.success_rate(),
            avg_latency_ms: state.avg_success_latency_ms(),
            rate_limited_in_window: state.window.iter().filter(|s| s.rate_limited).count(),
            increases: state.increases,
            decreases: state.decreases,
            rate_limit_events: state.rate_limit_events,
            total_recorded: state.total_recorded,
        }
    }

    // ── Windowed evaluation ──

    fn evaluate(&self, state: &mut ConcurrencyState) {
        let c = &self.config;
        let success_rate = state.success_rate().unwrap_or(0.0);
        let avg_latency = state.avg_success_latency_ms();
        let current = state.current_limit;

        let healthy = success_rate > c.high_success_threshold && avg_latency < c.low_latency_ms as f64;
        let unhealthy = success_rate < c.low_success_threshold || avg_latency > c.high_latency_ms as f64;

        let next = if healthy {
            let step = step_for(current, c.growth_fraction);
            (current + step).min(c.max_limit)
        } else if unhealthy {
            let step = step_for(current, c.shrink_fraction);
            current.saturating_sub(step).max(c.min_limit)
        } else {
            current
        };

        if next > current {
            state.increases += 1;
            info!(
                from = current,
                to = next,
                success_rate = %format!("{:.2}", success_rate),
                avg_latency_ms = avg_latency as u64,
                "📈 Raising concurrency"
            );
        } else if next < current {
            state.decreases += 1;
            info!(
                from = current,
                to = next,
                success_rate = %format!("{:.2}", success_rate),
                avg_latency_ms = avg_latency as u64,
                "📉 Lowering concurrency"
            );
        } else {
            debug!(limit = current, success_rate, avg_latency, "Concurrency unchanged");
        }
        state.current_limit = next;
    }

    fn lock(&self) -> MutexGuard<'_, ConcurrencyState> {
        // A poisoned window is still a valid window
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `round(current * fraction)`, but always at least one.
fn step_for(current: usize, fraction: f64) -> usize {
    ((current as f64 * fraction).round() as usize).max(1)
}
