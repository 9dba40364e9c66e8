//! Bounded multi-producer, multi-consumer work queues.
//!
//! A tokio `mpsc` channel whose receiver is shared behind a mutex so that
//! several workers can consume. The mutex is held only across a single
//! `recv`. Pushes and pops give up when the cancellation token fires; a
//! cancelled push hands the item back so it is never dropped.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::types::Order;

/// An order currently owned by the engine. Its store status is PROCESSING.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub order: Order,
    /// Non-terminal verdicts received since this claim.
    pub pending_cycles: u32,
}

impl WorkItem {
    pub fn claimed(order: Order) -> Self {
        Self { order, pending_cycles: 0 }
    }

    pub fn number(&self) -> &str {
        &self.order.number
    }
}

#[derive(Debug, Clone)]
pub struct WorkQueue {
    name: &'static str,
    tx: mpsc::Sender<WorkItem>,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
}

impl WorkQueue {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name,
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Push, waiting for space. Returns the item if cancelled first.
    pub async fn push(&self, item: WorkItem, cancel: &CancellationToken) -> Result<(), WorkItem> {
        if cancel.is_cancelled() {
            return Err(item);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(item),
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(item);
                    Ok(())
                }
                // The queue owns its receiver, so this cannot happen while
                // `self` is alive; hand the item back regardless.
                Err(_) => Err(item),
            },
        }
    }

    /// Pop the next item, or `None` once cancelled.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<WorkItem> {
        if cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = async {
                let mut rx = self.rx.lock().await;
                rx.recv().await
            } => item,
        }
    }

    /// Take everything currently queued without waiting.
    pub async fn drain(&self) -> Vec<WorkItem> {
        let mut rx = self.rx.lock().await;
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
