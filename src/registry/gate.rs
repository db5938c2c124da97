//! Bounded admission for outbound registry requests
//!
//! Every HTTP request takes a [`GatePermit`] right before it is sent and keeps it until
//! the response body has been consumed. Permits release on drop, so error paths and
//! cancelled futures give their slot back.

use crate::error::{RegistryError, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting gate limiting concurrent in-flight requests
#[derive(Debug, Clone)]
pub struct TransportGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl TransportGate {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(RegistryError::Validation(
                "Transport gate capacity must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Configured number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<GatePermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| RegistryError::Network(format!("Transport gate closed: {}", e)))?;
        Ok(GatePermit { _permit: permit })
    }
}

/// One occupied gate slot; dropping it releases the slot
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    /// Release the slot explicitly
    pub fn release(self) {}
}
