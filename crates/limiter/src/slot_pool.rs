//! Slot pool for admission control
//!
//! A fixed-capacity counting resource. Every admitted task holds exactly one
//! [`Reservation`]; the slot goes back to the pool when the reservation is
//! dropped, so a reservation cannot be released twice.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::trace;

/// Slot pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotPoolError {
    /// The pool was closed for shutdown
    #[error("slot pool is closed")]
    Closed,
}

/// Fixed-capacity pool of execution slots
///
/// Cloning yields another handle to the same pool.
///
/// # Example
///
/// ```
/// use concurrency_limiter::SlotPool;
///
/// let pool = SlotPool::new(6);
/// assert_eq!(pool.capacity(), 6);
/// assert_eq!(pool.available(), 6);
/// ```
#[derive(Debug, Clone)]
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl SlotPool {
    /// Create a pool with `capacity` slots
    ///
    /// Capacity is clamped to `1..=Semaphore::MAX_PERMITS`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot and reserve it
    ///
    /// Waiters are served in FIFO order. There is no upper bound on the wait.
    pub async fn acquire(&self) -> Result<Reservation, SlotPoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| SlotPoolError::Closed)?;

        trace!(
            in_use = self.in_use(),
            capacity = self.capacity,
            "Slot reserved"
        );

        Ok(Reservation { _permit: permit })
    }

    /// Reserve a slot if one is free right now
    pub fn try_acquire(&self) -> Result<Option<Reservation>, SlotPoolError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(Some(Reservation { _permit: permit })),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(SlotPoolError::Closed),
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Number of reserved slots
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Close the pool
    ///
    /// Pending and future acquisitions fail with [`SlotPoolError::Closed`].
    /// Outstanding reservations still return their slot when dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Check if the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// A claim on one slot of a [`SlotPool`]
///
/// Not `Clone`: the slot is returned exactly once, when this value is
/// dropped or passed to [`Reservation::release`].
#[derive(Debug)]
#[must_use = "dropping a reservation immediately releases its slot"]
pub struct Reservation {
    _permit: OwnedSemaphorePermit,
}

impl Reservation {
    /// Return the slot to the pool
    pub fn release(self) {
        drop(self);
    }
}
