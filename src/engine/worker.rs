//! Accrual worker.
//!
//! Takes claimed orders off the work queue, asks the accrual service about
//! each one and routes it by verdict. A worker never pushes onto its own
//! input queue: orders go to `returned` after failures and to `pending`
//! after non-terminal verdicts, and the dispatcher redelivers both.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::errors::{EngineError, ErrorSink};
use super::queue::{WorkItem, WorkQueue};
use super::rate_gate::RateGate;
use super::EngineStats;
use crate::oracle::{AccrualOracle, AccrualStatus, AccrualVerdict, Verdict};
use crate::retry::StoreRetryer;
use crate::storage::{OrderStore, StoreError};
use crate::types::{Order, OrderStatus};

/// Where an item goes once a worker is done with it.
#[derive(Debug)]
enum Disposition {
    /// Settled, reset or released; the engine no longer holds it.
    Done,
    Returned(WorkItem),
    Pending(WorkItem),
    /// Cancellation fired while the item was in hand.
    Stranded(WorkItem),
}

pub struct Worker {
    pub id: usize,
    pub store: Arc<dyn OrderStore>,
    pub oracle: Arc<dyn AccrualOracle>,
    pub gate: Arc<RateGate>,
    pub retryer: StoreRetryer,
    pub work: WorkQueue,
    pub returned: WorkQueue,
    pub pending: WorkQueue,
    pub errors: ErrorSink,
    pub stats: Arc<EngineStats>,
    pub max_pending_cycles: u32,
}

impl Worker {
    /// Process orders until cancelled. Returns the items in hand at
    /// cancellation so the drainer can reset them.
    pub async fn run(self, cancel: CancellationToken) -> Vec<WorkItem> {
        let mut stranded = Vec::new();

        while let Some(item) = self.work.pop(&cancel).await {
            let (queue, counter, item) = match self.process(item, &cancel).await {
                Disposition::Done => continue,
                Disposition::Stranded(item) => {
                    stranded.push(item);
                    break;
                }
                Disposition::Returned(item) => (&self.returned, &self.stats.returned, item),
                Disposition::Pending(item) => (&self.pending, &self.stats.pending, item),
            };

            match queue.push(item, &cancel).await {
                Ok(()) => EngineStats::add(counter, 1),
                Err(item) => {
                    stranded.push(item);
                    break;
                }
            }
        }

        debug!(worker = self.id, stranded = stranded.len(), "Worker stopped");
        stranded
    }

    async fn process(&self, mut item: WorkItem, cancel: &CancellationToken) -> Disposition {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Disposition::Stranded(item),
            _ = self.gate.wait() => {}
        }

        let number = item.order.number.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Disposition::Stranded(item),
            outcome = self.oracle.fetch_verdict(&number) => outcome,
        };

        match outcome {
            Err(source) => {
                self.errors.report(EngineError::Oracle { order: number, source });
                Disposition::Returned(item)
            }

            Ok(Verdict::RateLimited { retry_after }) => {
                match retry_after {
                    Some(delay) => self.gate.set_delay_for(delay),
                    None => self.errors.report(EngineError::RetryAfter { order: number }),
                }
                Disposition::Returned(item)
            }

            Ok(Verdict::Unknown) => {
                debug!(worker = self.id, order = %number, "Order unknown to accrual service");
                if self.reset(&item).await {
                    EngineStats::add(&self.stats.reset, 1);
                    Disposition::Done
                } else {
                    Disposition::Returned(item)
                }
            }

            Ok(Verdict::Assessed(verdict)) if !verdict.status.is_terminal() => {
                item.pending_cycles += 1;
                if self.max_pending_cycles > 0 && item.pending_cycles >= self.max_pending_cycles {
                    warn!(
                        order = %number,
                        status = %verdict.status,
                        cycles = item.pending_cycles,
                        "Order still not final, releasing claim"
                    );
                    if self.reset(&item).await {
                        EngineStats::add(&self.stats.released, 1);
                        return Disposition::Done;
                    }
                    return Disposition::Returned(item);
                }
                debug!(order = %number, status = %verdict.status, cycles = item.pending_cycles,
                    "Order not final yet");
                Disposition::Pending(item)
            }

            Ok(Verdict::Assessed(verdict)) => self.settle(item, verdict).await,
        }
    }

    async fn settle(&self, item: WorkItem, verdict: AccrualVerdict) -> Disposition {
        let settled = settled_order(&item.order, &verdict);
        match self.retryer.run("settle_order", || self.store.settle_order(&settled)).await {
            Ok(()) => {
                info!(worker = self.id, order = %settled.number, status = %settled.status,
                    accrual = ?settled.accrual, "Order settled");
                EngineStats::add(&self.stats.settled, 1);
                Disposition::Done
            }
            // Someone else settled or removed it; it is no longer ours to hold.
            Err(source @ (StoreError::NotClaimed(_) | StoreError::OrderNotFound(_))) => {
                self.errors.report(EngineError::Settle { order: settled.number, source });
                Disposition::Done
            }
            Err(source) if source.is_transient() => {
                self.errors.report(EngineError::Settle { order: settled.number, source });
                Disposition::Returned(item)
            }
            // Retrying cannot fix this verdict; give the claim up.
            Err(source) => {
                self.errors.report(EngineError::Settle { order: settled.number, source });
                if self.reset(&item).await {
                    EngineStats::add(&self.stats.released, 1);
                    Disposition::Done
                } else {
                    Disposition::Returned(item)
                }
            }
        }
    }

    /// Reset to NEW, reporting failure. Returns whether the reset landed.
    async fn reset(&self, item: &WorkItem) -> bool {
        match self.retryer.run("reset_order_to_new", || self.store.reset_order_to_new(item.number())).await {
            Ok(()) => true,
            Err(source) => {
                self.errors.report(EngineError::Reset { order: item.number().to_string(), source });
                false
            }
        }
    }
}

/// The order as it should be written for a terminal verdict.
fn settled_order(order: &Order, verdict: &AccrualVerdict) -> Order {
    let accrual = match verdict.status {
        AccrualStatus::Processed => Some(verdict.accrual.unwrap_or_default()),
        _ => None,
    };
    Order {
        status: OrderStatus::from(verdict.status),
        accrual,
        ..order.clone()
    }
}
