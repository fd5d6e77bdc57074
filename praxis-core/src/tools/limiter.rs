//! Global concurrency limit
//!
//! One semaphore bounds the number of handler executions in flight across
//! every capability. Waiters are served in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Why a slot could not be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    /// The caller gave up while waiting
    #[error("cancelled while waiting for a concurrency slot")]
    Cancelled,
    /// The limiter was closed by shutdown
    #[error("dispatcher is shutting down")]
    Closed,
}

/// Bounded pool of execution slots
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    max: usize,
}

impl ConcurrencyLimiter {
    /// Create a limiter with `max` slots, capped at [`Semaphore::MAX_PERMITS`]
    pub fn new(max: usize) -> Self {
        let max = max.min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Wait for a slot
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<ConcurrencySlot, LimiterError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LimiterError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| LimiterError::Closed)?
            }
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(ConcurrencySlot {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Refuse all current and future waiters
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Slots currently held
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of slots ever held at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Slots free right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured slot count
    pub fn max(&self) -> usize {
        self.max
    }
}

/// One held execution slot, released on drop
#[derive(Debug)]
pub struct ConcurrencySlot {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
