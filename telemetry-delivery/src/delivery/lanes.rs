//! Endpoint lane serialization.
//!
//! Send attempts for the same endpoint run one at a time, so a queue entry
//! is never posted by two attempts at once. Different endpoints proceed in
//! parallel.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use telemetry_types::Endpoint;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Time a lane can be held before warning
const LANE_HOLD_WARNING_SECS: u64 = 60;

/// Guard that releases the endpoint lane when dropped
pub struct EndpointLaneGuard {
    endpoint: Endpoint,
    _permit: OwnedSemaphorePermit,
    acquired_at: Instant,
}

impl Drop for EndpointLaneGuard {
    fn drop(&mut self) {
        let held = self.acquired_at.elapsed();
        if held.as_secs() > LANE_HOLD_WARNING_SECS {
            log::warn!(
                "[DELIVERY] {} lane held for {} seconds (unusually long)",
                self.endpoint,
                held.as_secs()
            );
        }
    }
}

#[derive(Clone, Default)]
pub struct EndpointLanes {
    /// One semaphore per endpoint - a single permit means one attempt at a time
    lanes: Arc<DashMap<Endpoint, Arc<Semaphore>>>,
}

impl EndpointLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to an endpoint.
    pub async fn acquire(&self, endpoint: Endpoint) -> EndpointLaneGuard {
        let semaphore = self
            .lanes
            .entry(endpoint)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let permit = semaphore
            .acquire_owned()
            .await
            .expect("Lane semaphore should not be closed");

        EndpointLaneGuard {
            endpoint,
            _permit: permit,
            acquired_at: Instant::now(),
        }
    }
}
