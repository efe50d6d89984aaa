//! Delivery lanes — a shared concurrency cap for outbound attempts.
//!
//! Each target owns at most one in-flight attempt; the lane bounds how many
//! targets may have an attempt in flight at the same time.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Semaphore-backed concurrency limit for delivery attempts.
#[derive(Debug, Clone)]
pub struct DeliveryLane {
    sem: Arc<Semaphore>,
}

impl DeliveryLane {
    /// Create a lane that admits `capacity` concurrent attempts (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Wait for a slot. Returns `None` once the lane has been closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.sem.clone().acquire_owned().await.ok()
    }

    /// Close the lane; pending and future `acquire` calls return `None`.
    pub fn close(&self) {
        self.sem.close();
    }
}
