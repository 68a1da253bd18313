//! Graceful shutdown coordination
//!
//! Shutdown happens in two phases. [`Shutdown::trigger`] stops admission:
//! transports stop reading and the dispatcher refuses new calls. Calls that
//! were already admitted keep running until they finish or the drain timeout
//! passes, at which point [`Shutdown::drain`] cancels whatever is left.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Shared shutdown state; clones observe the same shutdown
#[derive(Clone, Default)]
pub struct Shutdown {
    stop: CancellationToken,
    abort: CancellationToken,
    in_flight: Arc<InFlight>,
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Marks one admitted call; released on drop
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a call, or `None` once shutdown has been triggered
    pub fn enter(&self) -> Option<InFlightGuard> {
        if self.stop.is_cancelled() {
            return None;
        }
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
        };
        // Lost the race with trigger(); the guard's drop wakes any drainer
        if self.stop.is_cancelled() {
            return None;
        }
        Some(guard)
    }

    /// Stop admitting new calls
    pub fn trigger(&self) {
        if !self.stop.is_cancelled() {
            tracing::info!(in_flight = self.in_flight(), "Shutdown requested");
        }
        self.stop.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Cancelled when shutdown is triggered
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Cancelled when in-flight calls must be abandoned
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Calls admitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Resolves once no call is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Trigger shutdown and wait up to `timeout` for in-flight calls
    ///
    /// Returns `true` when every call finished in time. Otherwise the
    /// remaining calls are cancelled and `false` is returned.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.trigger();
        match tokio::time::timeout(timeout, self.wait_idle()).await {
            Ok(()) => {
                tracing::info!("All in-flight tool calls finished");
                true
            }
            Err(_) => {
                tracing::warn!(
                    in_flight = self.in_flight(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Drain timeout passed, cancelling remaining tool calls"
                );
                self.abort.cancel();
                false
            }
        }
    }
}
