//! Probe dispatcher: fans a target list out over an adaptive worker pool.
//!
//! Every target is first checked against the result cache. Fresh
//! successes and persistently failing targets are answered without
//! touching the network; everything else goes into a shared queue.
//!
//! Workers are spawned up to `max_limit`, but worker `n` only picks up
//! new work while `n < current_limit`. When the controller shrinks the
//! limit, the excess workers finish what they hold and then idle until
//! it grows again.
//!
//! Outcomes arrive in completion order and are slotted back into input
//! order before [`Dispatcher::run`] returns.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::classifier::Classify;
use super::concurrency::ConcurrencyController;
use super::retry::RetryExecutor;
use crate::adapters::Prober;
use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::outcome::{IndexedOutcome, OutcomeOrigin, ProbeOutcome, ProbeTarget};

/// One unique target and every input position it appeared at.
#[derive(Debug)]
struct Job {
    target: ProbeTarget,
    indices: Vec<usize>,
}

type Completion = (Vec<usize>, ProbeOutcome);

pub struct Dispatcher {
    cache: Option<Arc<ResultCache>>,
    skip_threshold: u32,
    controller: Arc<ConcurrencyController>,
    executor: Arc<RetryExecutor>,
    prober: Arc<dyn Prober>,
    classifier: Arc<dyn Classify>,
}

impl Dispatcher {
    pub fn new(config: &EngineConfig, prober: Arc<dyn Prober>, classifier: Arc<dyn Classify>) -> Self {
        Self {
            cache: None,
            skip_threshold: config.cache.skip_threshold,
            controller: Arc::new(ConcurrencyController::new(&config.concurrency)),
            executor: Arc::new(RetryExecutor::new(config.retry.clone(), config.api.timeout())),
            prober,
            classifier,
        }
    }

    /// Consult and update this cache. A `skip_threshold` of 0 never skips.
    pub fn with_cache(mut self, cache: Arc<ResultCache>, skip_threshold: u32) -> Self {
        self.cache = Some(cache);
        self.skip_threshold = skip_threshold;
        self
    }

    pub fn controller(&self) -> &Arc<ConcurrencyController> {
        &self.controller
    }

    /// Probe every target and return one outcome per input position.
    ///
    /// Each outcome is also sent on `events` as soon as it is known.
    /// Cancelling `cancel` stops new work and aborts in-flight attempts;
    /// unfinished targets come back as cancelled outcomes. Only
    /// infrastructure failures (cache storage, a crashed worker) are
    /// returned as `Err`.
    pub async fn run(
        &self,
        targets: Vec<ProbeTarget>,
        cancel: CancellationToken,
        events: Option<mpsc::UnboundedSender<IndexedOutcome>>,
    ) -> Result<Vec<ProbeOutcome>> {
        let total = targets.len();
        let ids: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();
        let mut slots: Vec<Option<ProbeOutcome>> = vec![None; total];

        // ── Dedupe ──
        let mut by_id: HashMap<String, usize> = HashMap::new();
        let mut jobs: Vec<Job> = Vec::new();
        for (index, target) in targets.into_iter().enumerate() {
            match by_id.get(&target.id) {
                Some(&j) => jobs[j].indices.push(index),
                None => {
                    by_id.insert(target.id.clone(), jobs.len());
                    jobs.push(Job { target, indices: vec![index] });
                }
            }
        }
        let unique = jobs.len();

        // ── Cache decisions ──
        let (mut cached, mut skipped) = (0usize, 0usize);
        let mut queue = VecDeque::new();
        for job in jobs {
            match self.cached_decision(&job.target)? {
                Some(outcome) => {
                    match outcome.origin {
                        OutcomeOrigin::Skipped => skipped += 1,
                        _ => cached += 1,
                    }
                    deliver(&mut slots, events.as_ref(), &job.indices, outcome);
                }
                None => queue.push_back(job),
            }
        }

        let queued = queue.len();
        info!(
            targets = total,
            unique,
            cached,
            skipped,
            queued,
            limit = self.controller.current_limit(),
            "🚀 Dispatching probes"
        );

        let queue = Arc::new(Mutex::new(queue));
        let failure: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));

        if queued > 0 {
            let token = cancel.child_token();
            let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
            let worker_count = self.controller.max_limit().min(queued);

            let mut handles = Vec::with_capacity(worker_count);
            for worker_id in 0..worker_count {
                let worker = Worker {
                    id: worker_id,
                    queue: Arc::clone(&queue),
                    failure: Arc::clone(&failure),
                    cache: self.cache.clone(),
                    controller: Arc::clone(&self.controller),
                    executor: Arc::clone(&self.executor),
                    prober: Arc::clone(&self.prober),
                    classifier: Arc::clone(&self.classifier),
                    token: token.clone(),
                    tx: tx.clone(),
                };
                handles.push(tokio::spawn(worker.run()));
            }
            drop(tx);

            while let Some((indices, outcome)) = rx.recv().await {
                deliver(&mut slots, events.as_ref(), &indices, outcome);
            }

            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Probe worker crashed: {}", e);
                    record_failure(&failure, EngineError::Worker(e.to_string())).await;
                }
            }
        }

        // Whatever is still queued never started
        let leftover: Vec<Job> = queue.lock().await.drain(..).collect();
        for job in leftover {
            let outcome = ProbeOutcome::cancelled(&job.target.id, 0);
            deliver(&mut slots, events.as_ref(), &job.indices, outcome);
        }

        let flushed = match &self.cache {
            Some(cache) => cache.flush(),
            None => Ok(0),
        };

        if let Some(e) = failure.lock().await.take() {
            return Err(e);
        }
        flushed?;

        let outcomes: Vec<ProbeOutcome> = slots
            .into_iter()
            .zip(ids)
            .map(|(slot, id)| slot.unwrap_or_else(|| ProbeOutcome::cancelled(&id, 0)))
            .collect();

        let snapshot = self.controller.snapshot();
        info!(
            outcomes = outcomes.len(),
            final_limit = snapshot.current_limit,
            increases = snapshot.increases,
            decreases = snapshot.decreases,
            rate_limit_events = snapshot.rate_limit_events,
            "🏁 Dispatch finished"
        );
        Ok(outcomes)
    }

    /// An outcome that answers the target without probing, if the cache has one.
    fn cached_decision(&self, target: &ProbeTarget) -> Result<Option<ProbeOutcome>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };

        if let Some(entry) = cache.lookup_at(&target.id, Utc::now())? {
            if entry.last_outcome.success {
                debug!(target_id = %target.id, "Cache hit");
                return Ok(Some(entry.last_outcome.with_origin(OutcomeOrigin::Cached)));
            }
        }

        if self.skip_threshold > 0 {
            if let Some(entry) = cache.peek(&target.id)? {
                if entry.failure_streak >= self.skip_threshold {
                    debug!(
                        target_id = %target.id,
                        streak = entry.failure_streak,
                        "Skipping persistently failing target"
                    );
                    return Ok(Some(entry.last_outcome.with_origin(OutcomeOrigin::Skipped)));
                }
            }
        }

        Ok(None)
    }
}

// ── Workers ─────────────────────────────────────────────────────────

struct Worker {
    id: usize,
    queue: Arc<Mutex<VecDeque<Job>>>,
    failure: Arc<Mutex<Option<EngineError>>>,
    cache: Option<Arc<ResultCache>>,
    controller: Arc<ConcurrencyController>,
    executor: Arc<RetryExecutor>,
    prober: Arc<dyn Prober>,
    classifier: Arc<dyn Classify>,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Completion>,
}

impl Worker {
    async fn run(self) {
        let mut limit_rx = self.controller.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                open = wait_for_slot(&mut limit_rx, self.id) => {
                    if !open {
                        break;
                    }
                }
            }

            let Some(job) = self.queue.lock().await.pop_front() else {
                break;
            };

            let report = self
                .executor
                .attempt(&job.target, self.prober.as_ref(), self.classifier.as_ref(), &self.token)
                .await;

            if report.cancelled {
                let _ = self.tx.send((job.indices, report.outcome));
                continue;
            }

            if let Some(cache) = &self.cache {
                if let Err(e) = cache.update(&job.target.id, &report.outcome) {
                    error!(target_id = %job.target.id, "Cache write failed, aborting run: {}", e);
                    record_failure(&self.failure, e).await;
                    self.token.cancel();
                    let _ = self.tx.send((job.indices, report.outcome));
                    break;
                }
            }

            self.controller.record(&report.outcome, report.rate_limited);

            if self.tx.send((job.indices, report.outcome)).is_err() {
                warn!(worker = self.id, "Outcome collector gone, stopping worker");
                break;
            }
        }
    }
}

/// Resolves once `worker_id` is inside the active limit. False if the
/// controller went away.
async fn wait_for_slot(rx: &mut watch::Receiver<usize>, worker_id: usize) -> bool {
    rx.wait_for(|limit| worker_id < *limit).await.is_ok()
}

async fn record_failure(slot: &Mutex<Option<EngineError>>, e: EngineError) {
    let mut slot = slot.lock().await;
    if slot.is_none() {
        *slot = Some(e);
    }
}

fn deliver(
    slots: &mut [Option<ProbeOutcome>],
    events: Option<&mpsc::UnboundedSender<IndexedOutcome>>,
    indices: &[usize],
    outcome: ProbeOutcome,
) {
    for &index in indices {
        if let Some(tx) = events {
            let _ = tx.send(IndexedOutcome { index, outcome: outcome.clone() });
        }
        slots[index] = Some(outcome.clone());
    }
}
