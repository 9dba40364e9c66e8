//! Shutdown drainer.
//!
//! Runs once, after the dispatcher and every worker have stopped. Whatever
//! the engine still holds is put back to NEW so the next run can claim it.

use std::collections::HashSet;
use tracing::{info, warn};

use super::errors::{EngineError, ErrorSink};
use super::queue::{WorkItem, WorkQueue};
use crate::retry::StoreRetryer;
use crate::storage::OrderStore;

/// Reset every item left in `queues` plus `stranded`. Returns how many
/// orders were reset; failures are reported and skipped.
pub async fn drain(
    store: &dyn OrderStore,
    retryer: &StoreRetryer,
    queues: &[&WorkQueue],
    mut stranded: Vec<WorkItem>,
    errors: &ErrorSink,
) -> usize {
    for queue in queues {
        let left = queue.drain().await;
        if !left.is_empty() {
            info!(queue = queue.name(), count = left.len(), "Draining queued orders");
        }
        stranded.extend(left);
    }

    let mut seen = HashSet::new();
    let mut reset = 0;
    for item in stranded {
        if !seen.insert(item.order.number.clone()) {
            continue;
        }
        match retryer.run("reset_order_to_new", || store.reset_order_to_new(item.number())).await {
            Ok(()) => reset += 1,
            Err(source) => {
                warn!(order = item.number(), "Order left PROCESSING at shutdown");
                errors.report(EngineError::Reset { order: item.order.number, source });
            }
        }
    }
    reset
}
