//! Process-wide "resume no earlier than" gate for oracle requests.
//!
//! The floor lives in one `AtomicU64` (nanoseconds past the gate's
//! origin), so every worker reads a whole value without taking a lock.
//! Only the worker calling `wait` is suspended.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
pub struct RateGate {
    origin: Instant,
    /// 0 means "open".
    resume_at_nanos: AtomicU64,
}

impl RateGate {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            resume_at_nanos: AtomicU64::new(0),
        }
    }

    /// Hold every caller of `wait` until at least `until`. The floor only
    /// ever moves forward.
    pub fn set_delay(&self, until: Instant) {
        let nanos = until.saturating_duration_since(self.origin).as_nanos();
        let nanos = u64::try_from(nanos).unwrap_or(u64::MAX);
        let previous = self.resume_at_nanos.fetch_max(nanos, Ordering::AcqRel);
        if nanos > previous {
            info!(
                delay_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Accrual service rate limit: pausing requests"
            );
        }
    }

    pub fn set_delay_for(&self, delay: Duration) {
        self.set_delay(Instant::now() + delay);
    }

    /// The current floor, if one has ever been set.
    pub fn resume_at(&self) -> Option<Instant> {
        match self.resume_at_nanos.load(Ordering::Acquire) {
            0 => None,
            nanos => Some(self.origin + Duration::from_nanos(nanos)),
        }
    }

    /// Suspend until the floor has passed. Re-checks after waking in case
    /// another worker raised the floor meanwhile.
    pub async fn wait(&self) {
        while let Some(until) = self.resume_at() {
            if Instant::now() >= until {
                return;
            }
            debug!(wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Waiting for rate gate");
            tokio::time::sleep_until(until).await;
        }
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}
