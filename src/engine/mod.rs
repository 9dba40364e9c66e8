//! Accrual processing engine.
//!
//! One dispatcher claims NEW orders and feeds the work queue, a fixed pool
//! of workers drives each order through the accrual service, and on
//! cancellation the drainer returns every order still held to NEW.
//!
//! ```text
//! store ──claim──▶ dispatcher ──▶ work queue ──▶ workers ──▶ accrual service
//!                     ▲   ▲                        │
//!                     │   └──── pending queue ◀────┤ (non-terminal verdict)
//!                     └──────── returned queue ◀───┘ (transient failure)
//! ```

pub mod dispatcher;
pub mod drainer;
pub mod errors;
pub mod queue;
pub mod rate_gate;
pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::oracle::AccrualOracle;
use crate::retry::{RetrySchedule, StoreRetryer};
use crate::storage::OrderStore;

use dispatcher::Dispatcher;
use errors::{EngineError, ErrorSink};
use queue::WorkQueue;
use rate_gate::RateGate;
use worker::Worker;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine settings, fixed for the engine's lifetime.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the dispatcher claims NEW orders.
    pub poll_interval: Duration,
    pub worker_count: usize,
    /// Capacity of each of the work, returned and pending queues.
    pub queue_capacity: usize,
    /// Maximum orders claimed per tick.
    pub claim_batch_size: u32,
    /// Minimum time before an order with a non-terminal verdict is asked
    /// about again.
    pub redelivery_delay: Duration,
    /// Minimum time before an order that hit a failure (oracle error, a 429
    /// without a usable hint, a failed settle) is tried again.
    pub returned_delay: Duration,
    /// Non-terminal verdicts tolerated per claim before the order is released
    /// back to NEW. 0 means unbounded.
    pub max_pending_cycles: u32,
    /// Reset orders left PROCESSING by a previous run before dispatching.
    pub recover_on_start: bool,
    pub store_retry: RetrySchedule,
    pub error_sink_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            worker_count: 5,
            queue_capacity: 50,
            claim_batch_size: 100,
            redelivery_delay: Duration::from_millis(500),
            returned_delay: Duration::from_secs(1),
            max_pending_cycles: 0,
            recover_on_start: true,
            store_retry: RetrySchedule::default(),
            error_sink_capacity: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counters updated by the engine's tasks.
#[derive(Debug, Default)]
pub struct EngineStats {
    claimed: AtomicU64,
    settled: AtomicU64,
    reset: AtomicU64,
    released: AtomicU64,
    returned: AtomicU64,
    pending: AtomicU64,
    recovered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Orders claimed from the store.
    pub claimed: u64,
    /// Orders settled to PROCESSED or INVALID.
    pub settled: u64,
    /// Orders reset to NEW after the accrual service did not know them.
    pub reset: u64,
    /// Orders released to NEW after exhausting `max_pending_cycles`.
    pub released: u64,
    /// Pushes onto the returned (failure) queue.
    pub returned: u64,
    /// Pushes onto the pending (non-terminal verdict) queue.
    pub pending: u64,
    /// Orders reset by start-up recovery.
    pub recovered: u64,
}

impl EngineStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            settled: self.settled.load(Ordering::Relaxed),
            reset: self.reset.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a completed `AccrualEngine::run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Orders the drainer put back to NEW.
    pub drained: usize,
    pub stats: StatsSnapshot,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct AccrualEngine {
    store: Arc<dyn OrderStore>,
    oracle: Arc<dyn AccrualOracle>,
    config: EngineConfig,
    gate: Arc<RateGate>,
    stats: Arc<EngineStats>,
    errors: Option<ErrorSink>,
}

impl AccrualEngine {
    pub fn new(store: Arc<dyn OrderStore>, oracle: Arc<dyn AccrualOracle>, config: EngineConfig) -> Self {
        Self {
            store,
            oracle,
            config,
            gate: Arc::new(RateGate::new()),
            stats: Arc::new(EngineStats::default()),
            errors: None,
        }
    }

    /// Send error reports to `sink` instead of a spawned logging task.
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.errors = Some(sink);
        self
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Share `gate` with the oracle client so its own retries honour the
    /// same pause as the workers.
    pub fn with_rate_gate(mut self, gate: Arc<RateGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Run until `cancel` fires, then drain. Every order the engine claimed
    /// is either settled or back to NEW when this returns.
    pub async fn run(self, cancel: CancellationToken) -> ShutdownReport {
        let AccrualEngine { store, oracle, config, gate, stats, errors } = self;

        let (errors, reporter) = match errors {
            Some(sink) => (sink, None),
            None => {
                let (sink, handle) = ErrorSink::spawn_reporter(config.error_sink_capacity);
                (sink, Some(handle))
            }
        };
        let retryer = StoreRetryer::new(config.store_retry.clone());

        if config.recover_on_start {
            match retryer.run("release_stale_claims", || store.release_stale_claims()).await {
                Ok(0) => {}
                Ok(n) => {
                    warn!(orders = n, "Released orders left PROCESSING by a previous run");
                    EngineStats::add(&stats.recovered, n);
                }
                Err(e) => errors.report(EngineError::Recovery(e)),
            }
        }

        let work = WorkQueue::new("work", config.queue_capacity);
        let returned = WorkQueue::new("returned", config.queue_capacity);
        let pending = WorkQueue::new("pending", config.queue_capacity);

        let dispatcher = Dispatcher {
            store: Arc::clone(&store),
            retryer: retryer.clone(),
            work: work.clone(),
            returned: returned.clone(),
            pending: pending.clone(),
            errors: errors.clone(),
            stats: Arc::clone(&stats),
            poll_interval: config.poll_interval,
            claim_batch_size: config.claim_batch_size,
            redelivery_delay: config.redelivery_delay,
            returned_delay: config.returned_delay,
        };
        let dispatcher = tokio::spawn(dispatcher.run(cancel.clone()));

        let workers: Vec<_> = (0..config.worker_count.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    store: Arc::clone(&store),
                    oracle: Arc::clone(&oracle),
                    gate: Arc::clone(&gate),
                    retryer: retryer.clone(),
                    work: work.clone(),
                    returned: returned.clone(),
                    pending: pending.clone(),
                    errors: errors.clone(),
                    stats: Arc::clone(&stats),
                    max_pending_cycles: config.max_pending_cycles,
                };
                tokio::spawn(worker.run(cancel.clone()))
            })
            .collect();

        info!(
            workers = workers.len(),
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            queue_capacity = config.queue_capacity,
            "Accrual engine started"
        );

        cancel.cancelled().await;
        info!("Shutdown signal received, draining accrual engine");

        let mut stranded = match dispatcher.await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "Dispatcher task failed");
                Vec::new()
            }
        };
        for joined in futures::future::join_all(workers).await {
            match joined {
                Ok(items) => stranded.extend(items),
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }

        let drained = drainer::drain(
            store.as_ref(),
            &retryer,
            &[&work, &returned, &pending],
            stranded,
            &errors,
        )
        .await;

        drop(errors);
        if let Some(reporter) = reporter {
            match reporter.await {
                Ok(reported) => info!(reported, "Error reporter stopped"),
                Err(e) => error!(error = %e, "Error reporter task failed"),
            }
        }

        let stats = stats.snapshot();
        info!(
            drained,
            claimed = stats.claimed,
            settled = stats.settled,
            reset = stats.reset,
            released = stats.released,
            returned = stats.returned,
            pending = stats.pending,
            "Accrual engine shut down cleanly"
        );

        ShutdownReport { drained, stats }
    }
}
