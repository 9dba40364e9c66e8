//! Dispatch loop.
//!
//! The only task that claims orders. On every tick it claims a batch of NEW
//! orders and hands them to the workers; between ticks it moves orders from
//! the returned and pending queues back onto the work queue. Pushes run in
//! short-lived helper tasks so a full work queue never stalls the loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::errors::{EngineError, ErrorSink};
use super::queue::{WorkItem, WorkQueue};
use super::EngineStats;
use crate::retry::StoreRetryer;
use crate::storage::OrderStore;

pub struct Dispatcher {
    pub store: Arc<dyn OrderStore>,
    pub retryer: StoreRetryer,
    pub work: WorkQueue,
    pub returned: WorkQueue,
    pub pending: WorkQueue,
    pub errors: ErrorSink,
    pub stats: Arc<EngineStats>,
    pub poll_interval: Duration,
    pub claim_batch_size: u32,
    pub redelivery_delay: Duration,
    pub returned_delay: Duration,
}

impl Dispatcher {
    /// Run until cancelled. Returns the items helpers could not deliver
    /// before cancellation; the caller owns resetting them.
    pub async fn run(self, cancel: CancellationToken) -> Vec<WorkItem> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut helpers: JoinSet<Vec<WorkItem>> = JoinSet::new();
        let mut stranded = Vec::new();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(done) = helpers.join_next(), if !helpers.is_empty() => {
                    stranded.extend(collect(done));
                }

                _ = ticker.tick() => {
                    let claimed = self.claim().await;
                    if !claimed.is_empty() {
                        self.spawn_push(&mut helpers, claimed, Duration::ZERO, &cancel);
                    }
                }

                Some(item) = self.returned.pop(&cancel) => {
                    debug!(order = item.number(), "Redispatching returned order");
                    self.spawn_push(&mut helpers, vec![item], self.returned_delay, &cancel);
                }

                Some(item) = self.pending.pop(&cancel) => {
                    self.spawn_push(&mut helpers, vec![item], self.redelivery_delay, &cancel);
                }
            }
        }

        while let Some(done) = helpers.join_next().await {
            stranded.extend(collect(done));
        }
        debug!(stranded = stranded.len(), "Dispatcher stopped");
        stranded
    }

    async fn claim(&self) -> Vec<WorkItem> {
        let limit = self.claim_batch_size;
        match self.retryer.run("claim_new_orders", || self.store.claim_new_orders(limit)).await {
            Ok(orders) => {
                if !orders.is_empty() {
                    info!(count = orders.len(), "Claimed new orders");
                    EngineStats::add(&self.stats.claimed, orders.len() as u64);
                }
                orders.into_iter().map(WorkItem::claimed).collect()
            }
            Err(e) => {
                self.errors.report(EngineError::Claim(e));
                Vec::new()
            }
        }
    }

    /// Push `items` onto the work queue in the background, after `delay`.
    /// The helper yields whatever it still holds when cancellation fires.
    fn spawn_push(
        &self,
        helpers: &mut JoinSet<Vec<WorkItem>>,
        items: Vec<WorkItem>,
        delay: Duration,
        cancel: &CancellationToken,
    ) {
        let work = self.work.clone();
        let cancel = cancel.clone();
        helpers.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return items,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let mut rest = items.into_iter();
            while let Some(item) = rest.next() {
                if let Err(item) = work.push(item, &cancel).await {
                    let mut left = vec![item];
                    left.extend(rest);
                    return left;
                }
            }
            Vec::new()
        });
    }
}

fn collect(done: Result<Vec<WorkItem>, JoinError>) -> Vec<WorkItem> {
    match done {
        Ok(items) => items,
        Err(e) => {
            error!(error = %e, "Dispatch helper failed");
            Vec::new()
        }
    }
}
