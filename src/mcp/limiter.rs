//! Concurrency limiter
//!
//! Bounds the number of tool calls executing at the same time, process wide.
//! Slots are handed out first-come-first-served by a fair semaphore and are
//! released when the returned [`Slot`] is dropped, on every exit path.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LimiterPolicy;
use crate::error::ToolError;
use crate::observability::Metrics;

/// Admission control for tool execution
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    policy: LimiterPolicy,
    metrics: Arc<Metrics>,
}

/// An acquired execution slot
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<Metrics>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.metrics.slot_released();
    }
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize, policy: LimiterPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy,
            metrics,
        }
    }

    /// Take a slot according to the configured policy
    ///
    /// With [`LimiterPolicy::Wait`] the call queues until a slot frees, the
    /// deadline passes (`capacity_exceeded`) or the call is cancelled.
    /// With [`LimiterPolicy::Reject`] a full limiter fails immediately.
    pub async fn acquire(
        &self,
        deadline: Instant,
        cancellation: &CancellationToken,
    ) -> Result<Slot, ToolError> {
        let permit = match self.policy {
            LimiterPolicy::Reject => match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    return Err(ToolError::capacity_exceeded(self.capacity))
                }
                Err(TryAcquireError::Closed) => {
                    return Err(ToolError::internal("concurrency limiter is closed"))
                }
            },
            LimiterPolicy::Wait => {
                let acquire = self.semaphore.clone().acquire_owned();
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        return Err(ToolError::cancelled("Tool call was cancelled while waiting for a slot"));
                    }
                    waited = tokio::time::timeout_at(deadline, acquire) => match waited {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => return Err(ToolError::internal("concurrency limiter is closed")),
                        Err(_) => {
                            tracing::warn!(capacity = self.capacity, "Deadline passed while waiting for an execution slot");
                            return Err(ToolError::capacity_exceeded(self.capacity));
                        }
                    },
                }
            }
        };

        self.metrics.slot_acquired();
        Ok(Slot {
            _permit: permit,
            metrics: self.metrics.clone(),
        })
    }

    /// Slots currently held
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
