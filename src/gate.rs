//! Admission control for inbound requests
//!
//! A fixed pool of slots bounds how many requests are processed at once.
//! Holding a [`Slot`] is holding admission; dropping it gives the slot back,
//! so every exit path releases exactly once.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("no slot freed within {0:?}")]
    Busy(Duration),
}

#[derive(Clone)]
pub struct ConcurrencyGate {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// An acquired admission slot, released on drop
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot, waiting at most `wait` for one to free up.
    ///
    /// Dropping the returned future (e.g. because the client went away)
    /// abandons the wait without consuming a slot.
    pub async fn acquire(&self, wait: Duration) -> Result<Slot, GateError> {
        // Fast path: no timer when a slot is free
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Ok(Slot { _permit: permit });
        }

        match tokio::time::timeout(wait, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Slot { _permit: permit }),
            // The semaphore is never closed; treat it like exhaustion
            Ok(Err(_)) | Err(_) => Err(GateError::Busy(wait)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free right now
    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release_on_drop() {
        let gate = ConcurrencyGate::new(2);
        assert_eq!(gate.capacity(), 2);

        let a = gate.acquire(Duration::from_millis(10)).await.unwrap();
        let b = gate.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(gate.available(), 0);

        drop(a);
        assert_eq!(gate.available(), 1);
        drop(b);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_after_timeout() {
        let gate = ConcurrencyGate::new(1);
        let _held = gate.acquire(Duration::from_millis(20)).await.unwrap();

        let err = gate.acquire(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, GateError::Busy(d) if d == Duration::from_millis(20)));
        assert_eq!(gate.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_slot_freed_in_time() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire(Duration::from_millis(20)).await.unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            drop(held);
        });

        let slot = gate.acquire(Duration::from_millis(50)).await;
        assert!(slot.is_ok());
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let gate = ConcurrencyGate::new(0);
        assert_eq!(gate.capacity(), 1);
        assert!(gate.acquire(Duration::from_millis(1)).await.is_ok());
    }
}
