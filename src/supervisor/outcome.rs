use nix::sys::signal::Signal;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// How a worker process ended, as reported by the kernel through `wait`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The process called `exit` with this code.
    NormalExit(i32),
    /// The process was terminated by this signal number.
    Signaled(i32),
    /// Waiting on the process failed; the exit cause is unknown.
    Error(String),
}

impl TerminationOutcome {
    pub fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => Self::from_status(status),
            Err(e) => Self::Error(e.to_string()),
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            Self::NormalExit(code)
        } else if let Some(sig) = status.signal() {
            Self::Signaled(sig)
        } else {
            Self::Error(format!("unrecognised wait status: {:?}", status))
        }
    }

    /// True when the exit was caused by the given signal, judged from the
    /// wait status rather than from timing.
    pub fn is_signal(&self, signal: Signal) -> bool {
        matches!(self, Self::Signaled(sig) if *sig == signal as i32)
    }

    /// The worker honoured a graceful stop: either SIGTERM's default action
    /// killed it, or it trapped SIGTERM and exited with status 0.
    pub fn is_graceful_stop(&self) -> bool {
        self.is_signal(Signal::SIGTERM) || *self == Self::NormalExit(0)
    }
}

impl fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NormalExit(code) => write!(f, "exited with status {}", code),
            Self::Signaled(sig) => match Signal::try_from(*sig) {
                Ok(signal) => write!(f, "terminated by {}", signal),
                Err(_) => write!(f, "terminated by signal {}", sig),
            },
            Self::Error(msg) => write!(f, "wait failed: {}", msg),
        }
    }
}
