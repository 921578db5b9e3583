use std::time::Duration;

use super::outcome::TerminationOutcome;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker already running")]
    AlreadyRunning,

    #[error("worker not running")]
    NotRunning,

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to signal worker: {0}")]
    Signal(#[source] nix::errno::Errno),

    /// The graceful stop did not finish in time and the worker was killed.
    #[error("worker did not stop within {0:?}, killed")]
    DeadlineExceeded(Duration),

    /// Stop observed an exit that was not caused by the graceful signal.
    #[error("worker {0} while stopping")]
    UngracefulExit(TerminationOutcome),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
