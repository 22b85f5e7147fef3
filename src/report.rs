//! Run summary, health score, alerts and JSON export.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AlertConfig;
use crate::error::Result;
use crate::outcome::{OutcomeOrigin, ProbeOutcome};
use crate::pool::ConcurrencySnapshot;

// ── Health score ────────────────────────────────────────────────────

const SUCCESS_WEIGHT: f64 = 0.5;
const SPEED_WEIGHT: f64 = 0.3;
const STABILITY_WEIGHT: f64 = 0.2;

/// Mean latency at or below this scores full marks for speed.
const FAST_LATENCY_MS: f64 = 2_000.0;
/// Speed points lost per extra second of mean latency.
const SPEED_PENALTY_PER_SEC: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    fn from_score(score: f64) -> Self {
        match score {
            s if s >= 90.0 => Grade::A,
            s if s >= 80.0 => Grade::B,
            s if s >= 70.0 => Grade::C,
            s if s >= 60.0 => Grade::D,
            _ => Grade::F,
        }
    }
}

/// 0-100 score for the API as a whole: success rate (50%), speed (30%),
/// stability (20%). Each component is itself 0-100.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthScore {
    pub score: f64,
    pub grade: Grade,
    pub success_score: f64,
    pub speed_score: f64,
    /// Share of failures carrying the most common error code. One dominant
    /// error means one clear problem; many different codes mean flapping.
    pub stability_score: f64,
}

impl HealthScore {
    /// Nothing was decided, so nothing is known to be healthy.
    fn unknown() -> Self {
        Self { score: 0.0, grade: Grade::F, success_score: 0.0, speed_score: 0.0, stability_score: 0.0 }
    }

    fn from_summary(s: &RunSummary) -> Self {
        if s.succeeded + s.failed == 0 {
            return Self::unknown();
        }

        let success_score = s.success_rate * 100.0;
        let speed_score = match s.mean_latency_ms {
            Some(ms) => (100.0 - (ms - FAST_LATENCY_MS) / 1_000.0 * SPEED_PENALTY_PER_SEC).clamp(0.0, 100.0),
            None => 0.0,
        };
        let stability_score = match s.by_error_code.values().max() {
            Some(&top) if s.failed > 0 => top as f64 / s.failed as f64 * 100.0,
            _ => 100.0,
        };

        let score =
            success_score * SUCCESS_WEIGHT + speed_score * SPEED_WEIGHT + stability_score * STABILITY_WEIGHT;
        Self { score, grade: Grade::from_score(score), success_score, speed_score, stability_score }
    }
}

// ── Alerts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowSuccessRate,
    SlowResponse,
    RateLimit,
    PermissionDenied,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

fn check_alerts(s: &RunSummary, thresholds: &AlertConfig) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if s.succeeded + s.failed == 0 {
        return alerts;
    }

    if s.success_rate < thresholds.min_success_rate {
        alerts.push(Alert {
            kind: AlertKind::LowSuccessRate,
            severity: Severity::High,
            message: format!(
                "Success rate {:.1}% below {:.1}%",
                s.success_rate * 100.0,
                thresholds.min_success_rate * 100.0
            ),
            value: s.success_rate,
            threshold: thresholds.min_success_rate,
        });
    }

    if let Some(ms) = s.mean_latency_ms {
        if ms > thresholds.max_avg_latency_ms as f64 {
            alerts.push(Alert {
                kind: AlertKind::SlowResponse,
                severity: Severity::Medium,
                message: format!("Mean latency {:.0}ms above {}ms", ms, thresholds.max_avg_latency_ms),
                value: ms,
                threshold: thresholds.max_avg_latency_ms as f64,
            });
        }
    }

    let counted = [
        (AlertKind::RateLimit, Severity::High, "HTTP_429", thresholds.max_rate_limited, "Rate limited"),
        (AlertKind::PermissionDenied, Severity::High, "HTTP_403", thresholds.max_forbidden, "Permission denied"),
        (AlertKind::Timeout, Severity::Medium, "TIMEOUT", thresholds.max_timeouts, "Timed out"),
    ];
    for (kind, severity, code, max, label) in counted {
        let count = s.by_error_code.get(code).copied().unwrap_or(0);
        if count > max {
            alerts.push(Alert {
                kind,
                severity,
                message: format!("{} {} times (limit {})", label, count, max),
                value: count as f64,
                threshold: max as f64,
            });
        }
    }

    alerts
}

// ── Summary ─────────────────────────────────────────────────────────

/// Aggregate view of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub probed: usize,
    pub cached: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failure counts keyed by error code. Cancelled targets are not failures.
    pub by_error_code: BTreeMap<String, usize>,
    /// Successes over all non-cancelled outcomes.
    pub success_rate: f64,
    pub mean_latency_ms: Option<f64>,
    pub elapsed_ms: u64,
    pub health: HealthScore,
    pub alerts: Vec<Alert>,
}

impl RunSummary {
    pub fn from_outcomes(outcomes: &[ProbeOutcome], elapsed: Duration, thresholds: &AlertConfig) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            probed: 0,
            cached: 0,
            skipped: 0,
            cancelled: 0,
            succeeded: 0,
            failed: 0,
            by_error_code: BTreeMap::new(),
            success_rate: 0.0,
            mean_latency_ms: None,
            elapsed_ms: elapsed.as_millis() as u64,
            health: HealthScore::unknown(),
            alerts: Vec::new(),
        };

        let mut latency_sum = 0u64;
        for o in outcomes {
            match o.origin {
                OutcomeOrigin::Probed => summary.probed += 1,
                OutcomeOrigin::Cached => summary.cached += 1,
                OutcomeOrigin::Skipped => summary.skipped += 1,
                OutcomeOrigin::Cancelled => {
                    summary.cancelled += 1;
                    continue;
                }
            }
            if o.success {
                summary.succeeded += 1;
                latency_sum += o.latency_ms;
            } else {
                summary.failed += 1;
                *summary.by_error_code.entry(o.error_code.clone()).or_default() += 1;
            }
        }

        let decided = summary.succeeded + summary.failed;
        if decided > 0 {
            summary.success_rate = summary.succeeded as f64 / decided as f64;
        }
        if summary.succeeded > 0 {
            summary.mean_latency_ms = Some(latency_sum as f64 / summary.succeeded as f64);
        }
        summary.health = HealthScore::from_summary(&summary);
        summary.alerts = check_alerts(&summary, thresholds);
        summary
    }

    pub fn log(&self) {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            total = self.total,
            probed = self.probed,
            cached = self.cached,
            skipped = self.skipped,
            cancelled = self.cancelled,
            "📊 Run complete"
        );
        info!(
            succeeded = self.succeeded,
            failed = self.failed,
            success_rate = %format!("{:.1}%", self.success_rate * 100.0),
            mean_latency_ms = self.mean_latency_ms.map(|l| l.round() as u64),
            elapsed_ms = self.elapsed_ms,
            "✅ Results"
        );
        for (code, count) in &self.by_error_code {
            info!(code = %code, count, "   failure");
        }
        let h = &self.health;
        info!(
            score = %format!("{:.1}", h.score),
            grade = ?h.grade,
            success = %format!("{:.1}", h.success_score),
            speed = %format!("{:.1}", h.speed_score),
            stability = %format!("{:.1}", h.stability_score),
            "🏥 API health"
        );
        for alert in &self.alerts {
            let icon = match alert.severity {
                Severity::High => "🔴",
                Severity::Medium => "🟡",
            };
            warn!(kind = ?alert.kind, severity = ?alert.severity, "{} {}", icon, alert.message);
        }
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }
}

/// Everything written to the JSON results file.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub run_id: &'a str,
    pub started_at: DateTime<Utc>,
    pub summary: &'a RunSummary,
    /// Controller state when the run ended.
    pub concurrency: &'a ConcurrencySnapshot,
    pub outcomes: &'a [ProbeOutcome],
}

impl RunReport<'_> {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
