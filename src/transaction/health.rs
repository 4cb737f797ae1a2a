//! Store health.
//!
//! Once a durable transaction fails to apply, the in-memory store no longer
//! matches the log. The store then refuses every commit until it is reopened,
//! at which point recovery replays the log tail.

use std::sync::atomic::{AtomicBool, Ordering};

use log::error;
use parking_lot::Mutex;

use super::error::{TransactionError, TransactionResult};

#[derive(Debug)]
pub struct StoreHealth {
    healthy: AtomicBool,
    cause: Mutex<Option<String>>,
}

impl StoreHealth {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            cause: Mutex::new(None),
        }
    }

    /// Marks the store unhealthy. The first cause is kept.
    pub fn panic(&self, cause: impl Into<String>) {
        let cause = cause.into();
        let mut slot = self.cause.lock();
        if slot.is_none() {
            error!("store health panic: {}", cause);
            *slot = Some(cause);
        }
        self.healthy.store(false, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn cause(&self) -> Option<String> {
        self.cause.lock().clone()
    }

    pub fn assert_healthy(&self) -> TransactionResult<()> {
        if self.is_healthy() {
            return Ok(());
        }
        let cause = self.cause().unwrap_or_else(|| "unknown cause".to_string());
        Err(TransactionError::StoreUnhealthy(cause))
    }
}

impl Default for StoreHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_keeps_first_cause() {
        let health = StoreHealth::new();
        assert!(health.assert_healthy().is_ok());

        health.panic("apply of Tx3 failed");
        health.panic("apply of Tx4 failed");

        assert!(!health.is_healthy());
        match health.assert_healthy() {
            Err(TransactionError::StoreUnhealthy(cause)) => {
                assert_eq!(cause, "apply of Tx3 failed")
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
