//! Shutdown coordination
//!
//! Tracks the pool's `Running -> Draining -> Stopped` lifecycle, owns the
//! pool-wide cancellation token handed to executing tasks, and caches the
//! first shutdown's result so repeated shutdown calls are no-ops that
//! report the same outcome.

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::task::TaskId;

/// Pool lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// Accepting submissions and executing tasks
    Running,
    /// Completing queued and in-flight tasks, rejecting new submissions
    Draining,
    /// All workers exited; the pool is inert
    Stopped,
}

/// Shutdown errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    /// The grace period elapsed with tasks still in flight; the listed
    /// tasks were cancelled but their underlying executions were not
    /// force-killed, so any that ignore cancellation leak until they
    /// return on their own
    #[error("forced shutdown with {} incomplete task(s)", incomplete.len())]
    Forced { incomplete: Vec<TaskId> },
}

pub(crate) struct Lifecycle {
    status: RwLock<PoolStatus>,
    drain_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    result: Mutex<Option<Result<(), ShutdownError>>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (drain_tx, _) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);
        Self {
            status: RwLock::new(PoolStatus::Running),
            drain_tx,
            stopped_tx,
            cancel: CancellationToken::new(),
            result: Mutex::new(None),
        }
    }

    pub fn status(&self) -> PoolStatus {
        *self.status.read()
    }

    pub fn is_running(&self) -> bool {
        self.status() == PoolStatus::Running
    }

    /// Transition to draining; returns false if a shutdown already began
    pub fn begin_drain(&self) -> bool {
        let mut status = self.status.write();
        if *status != PoolStatus::Running {
            return false;
        }
        *status = PoolStatus::Draining;
        self.drain_tx.send_replace(true);
        true
    }

    /// Subscribe to the drain signal (background loops stop on it)
    pub fn drain_signal(&self) -> watch::Receiver<bool> {
        self.drain_tx.subscribe()
    }

    /// Pool-wide cancellation token propagated to executing tasks
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every in-flight task's token
    pub fn force_cancel(&self) {
        self.cancel.cancel();
    }

    /// Record the shutdown result and transition to stopped
    pub fn mark_stopped(&self, result: Result<(), ShutdownError>) {
        *self.status.write() = PoolStatus::Stopped;
        *self.result.lock() = Some(result);
        self.stopped_tx.send_replace(true);
    }

    /// Wait for an in-progress shutdown and return its result
    pub async fn wait_stopped(&self) -> Result<(), ShutdownError> {
        let mut rx = self.stopped_tx.subscribe();
        // The sender lives as long as self, so this cannot error; treat a
        // closed channel as stopped anyway.
        let _ = rx.wait_for(|stopped| *stopped).await;
        self.result.lock().clone().unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_running() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.status(), PoolStatus::Running);
        assert!(lifecycle.is_running());
    }

    #[test]
    fn test_only_first_drain_wins() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_drain());
        assert!(!lifecycle.begin_drain());
        assert_eq!(lifecycle.status(), PoolStatus::Draining);
    }

    #[test]
    fn test_drain_signal_observed() {
        let lifecycle = Lifecycle::new();
        let rx = lifecycle.drain_signal();
        assert!(!*rx.borrow());
        lifecycle.begin_drain();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_stopped_returns_recorded_result() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_drain();
        let incomplete = vec![TaskId::now_v7()];
        lifecycle.mark_stopped(Err(ShutdownError::Forced {
            incomplete: incomplete.clone(),
        }));

        assert_eq!(lifecycle.status(), PoolStatus::Stopped);
        assert_eq!(
            lifecycle.wait_stopped().await,
            Err(ShutdownError::Forced { incomplete })
        );
    }

    #[test]
    fn test_force_cancel_trips_token() {
        let lifecycle = Lifecycle::new();
        let token = lifecycle.cancel_token().clone();
        assert!(!token.is_cancelled());
        lifecycle.force_cancel();
        assert!(token.is_cancelled());
    }
}
