//! Cooperative cancellation for running tasks.
//!
//! Cancelling never preempts a thread: a task only stops early if it polls
//! [`CancelToken::is_cancelled`] or sleeps through [`CancelToken::sleep`].

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancelled by the driver or a local management call.
    Cancelled,
    /// The task's timeout schedule fired.
    TimedOut,
    /// The node is dropping its driver connection.
    Reconnection,
    Shutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "Cancelled"),
            CancelReason::TimedOut => write!(f, "TimedOut"),
            CancelReason::Reconnection => write!(f, "Reconnection"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("task cancelled: {0}")]
pub struct Cancelled(pub CancelReason);

struct State {
    reason: Mutex<Option<CancelReason>>,
    changed: Condvar,
}

/// Observing side, handed to the task.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<State>,
}

/// Triggering side, kept by the execution manager.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<State>,
}

pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = Arc::new(State {
        reason: Mutex::new(None),
        changed: Condvar::new(),
    });
    (
        CancelToken {
            state: state.clone(),
        },
        CancelHandle { state },
    )
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.state.reason.lock().unwrap().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.state.reason.lock().unwrap()
    }

    /// Sleeps for `duration` unless cancelled first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        let mut reason = self.state.reason.lock().unwrap();
        loop {
            if let Some(r) = *reason {
                return Err(Cancelled(r));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            reason = self
                .state
                .changed
                .wait_timeout(reason, deadline - now)
                .unwrap()
                .0;
        }
    }
}

impl CancelHandle {
    /// Requests cancellation. Only the first reason is kept; returns `false` if the
    /// token was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let mut current = self.state.reason.lock().unwrap();
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        self.state.changed.notify_all();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.reason.lock().unwrap().is_some()
    }
}
