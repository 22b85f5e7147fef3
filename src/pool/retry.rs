//! Retry executor: one target, several attempts, classified result.
//!
//! Transient and rate-limited attempts are retried with exponential
//! backoff and jitter. Fatal attempts and successes return at once.
//! Nothing escapes except an [`AttemptReport`].

use rand::Rng;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::classifier::Classify;
use crate::adapters::{Prober, RawAttempt, TransportFailure, SNIPPET_MAX_CHARS};
use crate::config::RetryPolicy;
use crate::outcome::{truncate_chars, Classification, OutcomeOrigin, ProbeOutcome, ProbeTarget};

impl RetryPolicy {
    /// `base_delay * multiplier^index`, capped at `max_delay`. No jitter.
    pub fn base_delay(&self, attempt_index: u32) -> Duration {
        let ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt_index as i32);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Sleep before the next attempt: base delay plus up to
    /// `jitter_fraction` of it, raised to any server hint, capped.
    pub fn retry_delay(&self, attempt_index: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.base_delay(attempt_index).as_millis() as f64;
        let jitter_max = base * self.jitter_fraction;
        let jitter = if jitter_max > 0.0 {
            rand::thread_rng().gen_range(0.0..jitter_max)
        } else {
            0.0
        };

        let mut ms = base + jitter;
        if let Some(hint) = retry_after {
            ms = ms.max(hint.as_millis() as f64);
        }
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }
}

/// Everything the dispatcher needs to know about one executed target.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub outcome: ProbeOutcome,
    /// True if any attempt was rate limited, even when a later one succeeded.
    pub rate_limited: bool,
    pub cancelled: bool,
}

pub struct RetryExecutor {
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self { policy, attempt_timeout }
    }

    pub async fn attempt(
        &self,
        target: &ProbeTarget,
        prober: &dyn Prober,
        classifier: &dyn Classify,
        cancel: &CancellationToken,
    ) -> AttemptReport {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut rate_limited = false;

        loop {
            if cancel.is_cancelled() {
                return cancelled(target, attempts, rate_limited);
            }
            attempts += 1;

            let started = Instant::now();
            let raw = tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(target, attempts, rate_limited),
                res = tokio::time::timeout(self.attempt_timeout, prober.probe(target)) => match res {
                    Ok(raw) => raw,
                    Err(_) => RawAttempt::transport(
                        TransportFailure::Timeout,
                        started.elapsed().as_millis() as u64,
                        format!("no response within {}ms", self.attempt_timeout.as_millis()),
                    ),
                },
            };

            let verdict = classifier.classify(&raw);
            if verdict == Classification::RateLimited {
                rate_limited = true;
            }
            let outcome = build_outcome(target, &raw, verdict, attempts);

            if !verdict.is_retryable() || attempts >= max_attempts {
                if !outcome.success {
                    warn!(
                        target_id = %target.id,
                        code = %outcome.error_code,
                        attempts,
                        "❌ Probe failed"
                    );
                }
                return AttemptReport { outcome, rate_limited, cancelled: false };
            }

            let delay = self.policy.retry_delay(attempts - 1, raw.retry_after);
            debug!(
                target_id = %target.id,
                attempt = attempts,
                code = %outcome.error_code,
                delay_ms = delay.as_millis() as u64,
                "Retrying probe"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(target, attempts, rate_limited),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn cancelled(target: &ProbeTarget, attempts: u32, rate_limited: bool) -> AttemptReport {
    AttemptReport {
        outcome: ProbeOutcome::cancelled(&target.id, attempts),
        rate_limited,
        cancelled: true,
    }
}

fn build_outcome(
    target: &ProbeTarget,
    raw: &RawAttempt,
    verdict: Classification,
    attempts: u32,
) -> ProbeOutcome {
    let success = verdict == Classification::Success;
    let error_code = if success {
        String::new()
    } else {
        let code = raw.error_code();
        match (code.is_empty(), verdict.error_kind()) {
            // A custom classifier rejected a clean 2xx
            (true, Some(kind)) => kind.as_str().to_uppercase(),
            _ => code,
        }
    };

    ProbeOutcome {
        target_id: target.id.clone(),
        success,
        latency_ms: raw.latency_ms,
        error_kind: verdict.error_kind(),
        error_code,
        response_snippet: truncate_chars(&raw.snippet, SNIPPET_MAX_CHARS),
        timestamp: chrono::Utc::now(),
        attempts,
        origin: OutcomeOrigin::Probed,
    }
}
