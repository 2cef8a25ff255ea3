//! Two-phase close handshake between a component and its worker loop.
//!
//! `close` fires the close-start signal (cancelling the worker's token)
//! and then waits for close-end, which the worker fires by dropping or
//! finishing its [`WorkerGuard`] once it no longer touches the underlying
//! handle. A component whose worker never started closes without waiting.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a supervised worker, as seen from its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never started
    Idle,
    /// Worker loop running
    Running,
    /// Cancellation requested, worker still winding down
    Cancelling,
    /// Worker gone, handle released
    Closed,
}

/// What a call to [`ShutdownCoordinator::close`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// No worker was ever bound, nothing to wait for
    NeverStarted,
    /// The worker was cancelled and has released its guard
    Stopped,
    AlreadyClosed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("worker already started")]
    AlreadyStarted,
    #[error("component is closed, create a new one")]
    Closed,
}

enum Phase {
    Idle,
    // Holds the worker's cancellation: present iff a loop is active
    Running(CancellationToken),
    Closed,
}

struct Inner {
    phase: Mutex<Phase>,
    close_end: CancellationToken,
}

impl Inner {
    fn phase(&self) -> std::sync::MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                phase: Mutex::new(Phase::Idle),
                close_end: CancellationToken::new(),
            }),
        }
    }

    /// Binds a worker: returns the token the worker loop must watch, a
    /// child of `parent`, and the guard that signals close-end.
    /// A coordinator binds at most once.
    pub fn bind(
        &self,
        parent: &CancellationToken,
    ) -> Result<(CancellationToken, WorkerGuard), BindError> {
        let mut phase = self.inner.phase();
        match *phase {
            Phase::Idle => {
                let token = parent.child_token();
                *phase = Phase::Running(token.clone());
                let guard = WorkerGuard {
                    inner: self.inner.clone(),
                };
                Ok((token, guard))
            }
            Phase::Running(_) => Err(BindError::AlreadyStarted),
            Phase::Closed => Err(BindError::Closed),
        }
    }

    pub fn state(&self) -> SessionState {
        match &*self.inner.phase() {
            Phase::Idle => SessionState::Idle,
            Phase::Running(token) if token.is_cancelled() => SessionState::Cancelling,
            Phase::Running(_) => SessionState::Running,
            Phase::Closed => SessionState::Closed,
        }
    }

    /// Cancels the worker, if one is bound, and waits until it has let go
    /// of its guard. Safe to call more than once and on a coordinator that
    /// never bound a worker.
    pub async fn close(&self) -> CloseOutcome {
        let token = {
            let mut phase = self.inner.phase();
            match &*phase {
                Phase::Running(token) => token.clone(),
                Phase::Idle => {
                    *phase = Phase::Closed;
                    return CloseOutcome::NeverStarted;
                }
                Phase::Closed => return CloseOutcome::AlreadyClosed,
            }
        };
        token.cancel();
        self.inner.close_end.cancelled().await;
        CloseOutcome::Stopped
    }
}

/// Worker side of the handshake. Dropping it, on any path including a
/// panic, marks the worker as gone and releases a pending `close`.
pub struct WorkerGuard {
    inner: Arc<Inner>,
}

impl WorkerGuard {
    /// Signals close-end explicitly once teardown is complete.
    pub fn finish(self) {}
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let previous = std::mem::replace(&mut *self.inner.phase(), Phase::Closed);
        // Anything still watching the worker's token stops with it
        if let Phase::Running(token) = previous {
            token.cancel();
        }
        self.inner.close_end.cancel();
    }
}
