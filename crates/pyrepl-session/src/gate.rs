//! Single-permit concurrency gate
//!
//! A second caller fails immediately with [`Error::SessionBusy`] instead
//! of queuing behind the command in flight.

use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Guards the single shared interpreter
#[derive(Debug, Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

/// Proof of exclusive access; releases the gate on drop
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl Gate {
    /// Open gate
    #[must_use]
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the gate or fail with `SessionBusy`
    pub fn try_acquire(&self) -> Result<GatePermit> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .map(|permit| GatePermit { _permit: permit })
            .map_err(|_| Error::SessionBusy)
    }

    /// Whether a command currently holds the gate
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
