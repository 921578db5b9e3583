use nix::unistd::Pid;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

use super::outcome::TerminationOutcome;
use super::watcher::SignalRequest;

/// Resolved exactly once, by the exit watcher, when the worker terminates.
pub type ExitSignal = watch::Receiver<Option<TerminationOutcome>>;

/// Everything the supervisor mutates. Guarded by a single lock; every write
/// is a complete assignment made while holding it.
///
/// `handle.is_some()` is the running flag: it is set by `start` and cleared
/// only by the exit watcher, before the exit outcome is published.
#[derive(Debug)]
pub struct WorkerState {
    pub config: String,
    pub handle: Option<WorkerHandle>,
    pub last_exit: Option<TerminationOutcome>,
}

#[derive(Debug)]
pub struct WorkerHandle {
    pub pid: Pid,
    pub exited: ExitSignal,
    /// Signals go through the watcher, which owns the child.
    pub signals: mpsc::Sender<SignalRequest>,
    /// Set once a stop has signalled the worker, so the watcher can tell an
    /// operator stop from the worker dying on its own.
    pub stop_requested: bool,
}

impl WorkerState {
    pub fn new(config: String) -> Self {
        Self {
            config,
            handle: None,
            last_exit: None,
        }
    }
}

/// A panic while holding the lock cannot leave a half-written field behind,
/// so a poisoned lock is still safe to use.
pub fn lock_state(state: &Mutex<WorkerState>) -> MutexGuard<'_, WorkerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
