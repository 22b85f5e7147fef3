//! modelprobe: probe every model an OpenAI-compatible API advertises.
//!
//! One run: load config, discover models, answer what the cache already
//! knows, probe the rest under adaptive concurrency, report.
//!
//! Ctrl-C stops new probes and aborts in-flight ones; everything already
//! finished is still cached and reported.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use modelprobe::adapters::openai::OpenAiProber;
use modelprobe::cache::ResultCache;
use modelprobe::config::{data_dir, EngineConfig, LoggingConfig};
use modelprobe::discovery::{self, CapabilityRules};
use modelprobe::outcome::{IndexedOutcome, OutcomeOrigin};
use modelprobe::pool::{Dispatcher, HttpClassifier};
use modelprobe::report::{RunReport, RunSummary};

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("modelprobe={}", logging.level).into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.logging);

    let run_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!("run", run_id = %run_id);
    run(config, run_id).instrument(span).await
}

async fn run(config: EngineConfig, run_id: String) -> Result<()> {
    let started_at = chrono::Utc::now();
    let clock = Instant::now();

    info!("🔬 modelprobe v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        base_url = %config.api.base_url,
        initial = config.concurrency.initial_limit,
        min = config.concurrency.min_limit,
        max = config.concurrency.max_limit,
        max_attempts = config.retry.max_attempts,
        "Configuration loaded"
    );
    if config.api.api_key.is_empty() {
        warn!("No API key configured (set MODELPROBE_API_KEY or api.api_key)");
    }

    // ── Cache ───────────────────────────────────────────────────────
    let cache = if config.cache.enabled {
        std::fs::create_dir_all(data_dir()).context("Failed to create data directory")?;
        let path = config.cache.resolved_path();
        let cache = ResultCache::open(&path, config.cache.ttl(), config.cache.buffer_size)
            .with_context(|| format!("Failed to open result cache at {}", path.display()))?;
        let stats = cache.stats().context("Failed to read cache statistics")?;
        info!(
            path = %path.display(),
            entries = stats.total,
            successes = stats.successes,
            failures = stats.failures,
            "📦 Result cache ready"
        );
        Some(Arc::new(cache))
    } else {
        info!("📦 Result cache disabled");
        None
    };

    // ── Discovery ───────────────────────────────────────────────────
    let prober = Arc::new(
        OpenAiProber::new(&config.api, &config.probe).context("Failed to build HTTP client")?,
    );
    let mut targets = discovery::discover_targets(&prober, &CapabilityRules::default())
        .await
        .context("Model discovery failed")?;

    if config.probe.only_failed {
        if let Some(cache) = &cache {
            let failed = cache.failed_targets().context("Failed to list previously failed models")?;
            let discovered = targets.len();
            targets = discovery::retain_failed(targets, &failed);
            info!(discovered, retesting = targets.len(), "🔁 Retesting previously failed models only");
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────
    let mut dispatcher = Dispatcher::new(&config, prober, Arc::new(HttpClassifier));
    if let Some(cache) = &cache {
        dispatcher = dispatcher.with_cache(Arc::clone(cache), config.cache.skip_threshold);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupted, cancelling outstanding probes");
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<IndexedOutcome>();
    let total = targets.len();
    let progress = tokio::spawn(
        async move {
            let mut done = 0usize;
            while let Some(IndexedOutcome { outcome, .. }) = rx.recv().await {
                done += 1;
                match (outcome.success, outcome.origin) {
                    (_, OutcomeOrigin::Cancelled) => {}
                    (true, origin) => info!(
                        progress = %format!("{}/{}", done, total),
                        target_id = %outcome.target_id,
                        latency_ms = outcome.latency_ms,
                        ?origin,
                        "✓"
                    ),
                    (false, origin) => info!(
                        progress = %format!("{}/{}", done, total),
                        target_id = %outcome.target_id,
                        code = %outcome.error_code,
                        ?origin,
                        "✗"
                    ),
                }
            }
        }
        .in_current_span(),
    );

    let outcomes = dispatcher
        .run(targets, cancel, Some(tx))
        .await
        .context("Probe run aborted")?;
    progress.await.unwrap_or_else(|e| warn!("Progress logger failed: {}", e));

    // ── Report ──────────────────────────────────────────────────────
    let summary = RunSummary::from_outcomes(&outcomes, clock.elapsed(), &config.alerts);
    summary.log();
    let concurrency = dispatcher.controller().snapshot();

    let threshold = config.cache.skip_threshold;
    if let (Some(cache), true) = (&cache, threshold > 0) {
        let persistent = cache.persistent_failures(threshold).context("Failed to query failure streaks")?;
        if !persistent.is_empty() {
            info!(count = persistent.len(), threshold, "⚠️  Persistently failing models");
            for f in persistent.iter().take(20) {
                info!(target_id = %f.target_id, streak = f.failure_streak, code = %f.last_error_code, "   skipped next run");
            }
        }
    }

    if let Some(path) = &config.output.json_path {
        RunReport {
            run_id: &run_id,
            started_at,
            summary: &summary,
            concurrency: &concurrency,
            outcomes: &outcomes,
        }
        .write_json(path)
        .with_context(|| format!("Failed to write results to {}", path.display()))?;
        info!(path = %path.display(), "💾 Results written");
    }

    Ok(())
}
