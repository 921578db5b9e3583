use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::{Arc, Mutex};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::outcome::TerminationOutcome;
use super::state::{lock_state, WorkerState};

/// A request for the watcher to signal the child it owns.
#[derive(Debug)]
pub struct SignalRequest {
    pub signal: Signal,
    pub reply: oneshot::Sender<nix::Result<()>>,
}

/// Spawn the exit watcher for one worker instance.
///
/// The watcher owns the child. Signals are delivered from here, and only
/// while the child is unreaped, so its pid cannot have been recycled. Once
/// `wait` returns, the handle is cleared under the lock and only afterwards
/// is `exited` resolved, so anyone woken by the outcome already sees the
/// supervisor as stopped.
pub fn spawn_exit_watcher(
    mut child: Child,
    pid: Pid,
    state: Arc<Mutex<WorkerState>>,
    mut signals: mpsc::Receiver<SignalRequest>,
    exited: watch::Sender<Option<TerminationOutcome>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(req) = signals.recv() => {
                    let result = match child.id() {
                        Some(id) => kill(Pid::from_raw(id as i32), req.signal),
                        None => Err(Errno::ESRCH),
                    };
                    let _ = req.reply.send(result);
                }
            }
        };
        // Requests still queued are answered with ESRCH when `signals` drops.
        drop(signals);
        let outcome = TerminationOutcome::from_wait(status);

        let stop_requested = {
            let mut guard = lock_state(&state);
            let stop_requested = guard
                .handle
                .as_ref()
                .filter(|h| h.pid == pid)
                .is_some_and(|h| h.stop_requested);
            guard.handle = None;
            guard.last_exit = Some(outcome.clone());
            stop_requested
        };

        if stop_requested {
            tracing::info!(pid = pid.as_raw(), outcome = %outcome, "worker exited");
        } else {
            tracing::warn!(pid = pid.as_raw(), outcome = %outcome, "worker exited unexpectedly");
        }

        exited.send_replace(Some(outcome));
    })
}

/// Ask the watcher to deliver `signal`. A watcher that is gone means the
/// child has already been reaped, reported as ESRCH.
pub async fn send_signal(signals: &mpsc::Sender<SignalRequest>, signal: Signal) -> nix::Result<()> {
    let (reply, answer) = oneshot::channel();
    if signals.send(SignalRequest { signal, reply }).await.is_err() {
        return Err(Errno::ESRCH);
    }
    answer.await.unwrap_or(Err(Errno::ESRCH))
}

/// Wait until the watcher publishes the exit outcome.
pub async fn wait_for_exit(exited: &mut watch::Receiver<Option<TerminationOutcome>>) -> TerminationOutcome {
    match exited.wait_for(Option::is_some).await {
        Ok(outcome) => outcome
            .clone()
            .unwrap_or_else(|| TerminationOutcome::Error("exit outcome missing".to_string())),
        Err(_) => TerminationOutcome::Error("exit watcher dropped without reporting".to_string()),
    }
}
