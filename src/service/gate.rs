//! Bounded concurrency gate for store queries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Why a permit could not be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// No permit became free within the acquire timeout.
    TimedOut(Duration),
    /// The gate was closed.
    Closed,
}

/// A counting gate shared by every caller of the service.
///
/// Permits are released when the returned [`GatePermit`] is dropped, which
/// covers early returns, errors and cancelled futures alike.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
}

/// A held slot on a [`ConcurrencyGate`].
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
        }
    }

    /// Wait for a permit, giving up after the acquire timeout.
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        match tokio::time::timeout(self.acquire_timeout, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(GatePermit { _permit: permit }),
            Ok(Err(_)) => Err(GateError::Closed),
            Err(_) => Err(GateError::TimedOut(self.acquire_timeout)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_release_on_drop() {
        let gate = ConcurrencyGate::new(2, Duration::from_millis(10));
        let a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_flight(), 2);

        drop(a);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_saturated() {
        let gate = ConcurrencyGate::new(1, Duration::from_millis(250));
        let _held = gate.acquire().await.unwrap();

        let err = gate.acquire().await.unwrap_err();
        assert_eq!(err, GateError::TimedOut(Duration::from_millis(250)));
        assert_eq!(gate.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_holder_frees_its_permit() {
        let gate = ConcurrencyGate::new(1, Duration::from_secs(1));

        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
        };
        while gate.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        holder.abort();
        let _ = holder.await;
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_permit_when_released() {
        let gate = ConcurrencyGate::new(1, Duration::from_secs(5));
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap());
    }
}
