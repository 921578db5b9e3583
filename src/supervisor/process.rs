use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use super::error::{Result, SupervisorError};
use super::outcome::TerminationOutcome;
use super::state::{lock_state, WorkerHandle, WorkerState};
use super::watcher::{send_signal, spawn_exit_watcher, wait_for_exit};

/// Argument the worker binary expects in front of everything else.
pub const DEFAULT_WORKER_ARGS: &[&str] = &["run"];

/// Owns the single worker process on this node.
///
/// All lifecycle verbs may be called concurrently. The state lock is only
/// held for bookkeeping and for the spawn itself; signal delivery and the
/// wait for exit happen outside it, so `is_running` and `config` never block
/// behind a slow stop.
#[derive(Debug)]
pub struct ProcessSupervisor {
    executable: PathBuf,
    args: Vec<String>,
    state: Arc<Mutex<WorkerState>>,
}

impl ProcessSupervisor {
    pub fn new(executable: impl Into<PathBuf>, config: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: DEFAULT_WORKER_ARGS.iter().map(|a| a.to_string()).collect(),
            state: Arc::new(Mutex::new(WorkerState::new(config.into()))),
        }
    }

    /// Replace the argument list passed to the worker.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        lock_state(&self.state)
    }

    /// Spawn the worker with the current config on its stdin.
    ///
    /// Returns once the process exists; whether the worker comes up healthy
    /// is not checked.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.lock();
        if guard.handle.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let pid = match child.id() {
            Some(id) => Pid::from_raw(id as i32),
            None => {
                return Err(SupervisorError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "worker exited before its pid could be read",
                )))
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let blob = guard.config.clone();
            tokio::spawn(async move {
                // Dropping stdin afterwards gives the worker EOF.
                if let Err(e) = stdin.write_all(blob.as_bytes()).await {
                    tracing::warn!(pid = pid.as_raw(), "Failed to deliver config to worker: {}", e);
                }
            });
        }

        let (exited_tx, exited_rx) = watch::channel(None);
        let (signals_tx, signals_rx) = mpsc::channel(4);
        guard.handle = Some(WorkerHandle {
            pid,
            exited: exited_rx,
            signals: signals_tx,
            stop_requested: false,
        });
        spawn_exit_watcher(child, pid, self.state.clone(), signals_rx, exited_tx);

        tracing::info!(
            pid = pid.as_raw(),
            executable = %self.executable.display(),
            config_bytes = guard.config.len(),
            "worker started"
        );
        Ok(())
    }

    /// Ask the worker to exit with SIGTERM, escalating to SIGKILL if it is
    /// still alive when `deadline` elapses.
    ///
    /// Stopping an idle supervisor succeeds without touching anything.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        self.stop_inner(deadline).await.map(|_| ())
    }

    /// Returns `Ok(false)` when there was no worker to stop.
    async fn stop_inner(&self, deadline: Duration) -> Result<bool> {
        let (pid, signals, mut exited) = {
            let mut guard = self.lock();
            match guard.handle.as_mut() {
                None => return Ok(false),
                Some(handle) => {
                    handle.stop_requested = true;
                    (handle.pid, handle.signals.clone(), handle.exited.clone())
                }
            }
        };
        let mut exited_after_kill = exited.clone();

        tracing::info!(pid = pid.as_raw(), deadline_ms = deadline.as_millis() as u64, "stopping worker");
        send_signal(&signals, Signal::SIGTERM)
            .await
            .map_err(SupervisorError::Signal)?;

        tokio::select! {
            outcome = wait_for_exit(&mut exited) => {
                if outcome.is_graceful_stop() {
                    Ok(true)
                } else {
                    Err(SupervisorError::UngracefulExit(outcome))
                }
            }
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(pid = pid.as_raw(), "worker ignored SIGTERM, sending SIGKILL");
                if let Err(e) = send_signal(&signals, Signal::SIGKILL).await {
                    // Already reaped: the watcher has reported it.
                    tracing::debug!(pid = pid.as_raw(), "SIGKILL not delivered: {}", e);
                }
                let outcome = wait_for_exit(&mut exited_after_kill).await;
                tracing::debug!(pid = pid.as_raw(), outcome = %outcome, "worker reaped after kill");
                Err(SupervisorError::DeadlineExceeded(deadline))
            }
        }
    }

    /// Stop then start. Never bootstraps a worker that is not running.
    ///
    /// Whether a worker was running is decided by the stop itself, so a worker
    /// that exits on its own just before the restart is not brought back.
    /// If the stop fails, nothing is started.
    pub async fn restart(&self, deadline: Duration) -> Result<()> {
        if !self.stop_inner(deadline).await? {
            return Err(SupervisorError::NotRunning);
        }
        self.start().await
    }

    /// Takes effect on the next start; a running worker keeps its config.
    pub fn update_config(&self, config: impl Into<String>) {
        let config = config.into();
        let len = config.len();
        self.lock().config = config;
        tracing::info!(config_bytes = len, "worker config updated");
    }

    pub fn config(&self) -> String {
        self.lock().config.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().handle.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().handle.as_ref().map(|h| h.pid.as_raw() as u32)
    }

    pub fn last_exit(&self) -> Option<TerminationOutcome> {
        self.lock().last_exit.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// A supervisor whose worker is `/bin/sh -c <script>`.
    fn sh_supervisor(script: &str, config: &str) -> ProcessSupervisor {
        ProcessSupervisor::new("/bin/sh", config).with_args(["-c", script])
    }

    async fn wait_until_stopped(sup: &ProcessSupervisor, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if !sup.is_running() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        !sup.is_running()
    }

    async fn read_when(path: &Path, limit: Duration, pred: impl Fn(&str) -> bool) -> String {
        let start = Instant::now();
        loop {
            let content = tokio::fs::read_to_string(path).await.unwrap_or_default();
            if pred(&content) || start.elapsed() > limit {
                return content;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_default_args() {
        let sup = ProcessSupervisor::new("/opt/worker/bin", "{}");
        assert_eq!(sup.args, vec!["run".to_string()]);
        assert_eq!(sup.executable(), Path::new("/opt/worker/bin"));
        assert!(!sup.is_running());
        assert!(sup.pid().is_none());
    }

    #[tokio::test]
    async fn test_stop_never_started_is_noop() {
        let sup = sh_supervisor("exec sleep 30", "{}");
        let start = Instant::now();
        sup.stop(Duration::from_secs(5)).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(sup.last_exit().is_none());
    }

    #[tokio::test]
    async fn test_start_twice_already_running() {
        let sup = sh_supervisor("exec sleep 30", "{}");
        sup.start().await.unwrap();
        assert!(sup.is_running());
        assert!(sup.pid().is_some());

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning));

        sup.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!sup.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_exactly_one_wins() {
        let sup = Arc::new(sh_supervisor("exec sleep 30", "{}"));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let sup = sup.clone();
            tasks.push(tokio::spawn(async move { sup.start().await }));
        }

        let mut ok = 0;
        let mut already = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => ok += 1,
                Err(SupervisorError::AlreadyRunning) => already += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(already, 7);

        sup.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let sup = ProcessSupervisor::new("/nonexistent/relayd-worker", "{}");
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(_)));
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_graceful_stop_returns_at_exit_not_deadline() {
        let sup = sh_supervisor("exec sleep 30", "{}");
        sup.start().await.unwrap();

        let start = Instant::now();
        sup.stop(Duration::from_secs(5)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!sup.is_running());
        assert!(sup.last_exit().unwrap().is_signal(Signal::SIGTERM));
    }

    #[tokio::test]
    async fn test_trapped_sigterm_clean_exit_is_success() {
        let sup = sh_supervisor("trap 'exit 0' TERM; while :; do sleep 1; done", "{}");
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        sup.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(sup.last_exit(), Some(TerminationOutcome::NormalExit(0)));
    }

    #[tokio::test]
    async fn test_stop_surfaces_ungraceful_exit() {
        let sup = sh_supervisor("trap 'exit 7' TERM; while :; do sleep 1; done", "{}");
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = sup.stop(Duration::from_secs(5)).await.unwrap_err();
        match err {
            SupervisorError::UngracefulExit(outcome) => {
                assert_eq!(outcome, TerminationOutcome::NormalExit(7))
            }
            other => panic!("expected UngracefulExit, got {}", other),
        }
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_stop_deadline_kills_stubborn_worker() {
        let sup = sh_supervisor("trap '' TERM; exec sleep 30", "{}");
        sup.start().await.unwrap();
        // Give the shell time to install the trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        let err = sup.stop(Duration::from_millis(200)).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, SupervisorError::DeadlineExceeded(d) if d == Duration::from_millis(200)));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        assert!(!sup.is_running());
        assert!(sup.last_exit().unwrap().is_signal(Signal::SIGKILL));

        // Nothing left behind blocks the next start.
        sup.start().await.unwrap();
        let _ = sup.stop(Duration::from_millis(200)).await;
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_restart_idle_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let sup = sh_supervisor(&format!("touch {}; exec sleep 30", marker.display()), "{}");

        let err = sup.restart(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning));
        assert!(!sup.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!marker.exists(), "restart must not spawn anything");
    }

    #[tokio::test]
    async fn test_update_config_applies_on_restart_only() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("stdin.log");
        let script = format!("cat >> {}; echo >> {}; exec sleep 30", capture.display(), capture.display());
        let sup = sh_supervisor(&script, r#"{"v":1}"#);

        sup.start().await.unwrap();
        let first = read_when(&capture, Duration::from_secs(2), |c| c.contains(r#"{"v":1}"#)).await;
        assert_eq!(first.lines().collect::<Vec<_>>(), vec![r#"{"v":1}"#]);
        let pid_before = sup.pid();

        sup.update_config(r#"{"v":2}"#);
        assert_eq!(sup.config(), r#"{"v":2}"#);
        assert_eq!(sup.pid(), pid_before, "update must not touch the live worker");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let unchanged = tokio::fs::read_to_string(&capture).await.unwrap();
        assert_eq!(unchanged.lines().count(), 1);

        sup.restart(Duration::from_secs(5)).await.unwrap();
        assert!(sup.is_running());
        assert_ne!(sup.pid(), pid_before);

        let both = read_when(&capture, Duration::from_secs(2), |c| c.contains(r#"{"v":2}"#)).await;
        assert_eq!(both.lines().collect::<Vec<_>>(), vec![r#"{"v":1}"#, r#"{"v":2}"#]);

        sup.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_self_exit_is_reflected_in_status() {
        let sup = sh_supervisor("exit 3", "{}");
        sup.start().await.unwrap();

        assert!(wait_until_stopped(&sup, Duration::from_secs(2)).await);
        assert_eq!(sup.last_exit(), Some(TerminationOutcome::NormalExit(3)));

        // A crashed worker can be started again without an explicit stop.
        sup.start().await.unwrap();
        assert!(wait_until_stopped(&sup, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_status_not_blocked_by_pending_stop() {
        let sup = Arc::new(sh_supervisor("trap '' TERM; exec sleep 30", "{}"));
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopper = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.stop(Duration::from_millis(500)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let began = Instant::now();
        assert!(sup.is_running());
        assert_eq!(sup.config(), "{}");
        assert!(began.elapsed() < Duration::from_millis(50));

        assert!(matches!(stopper.await.unwrap(), Err(SupervisorError::DeadlineExceeded(_))));
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_stops_both_complete() {
        let sup = Arc::new(sh_supervisor("exec sleep 30", "{}"));
        sup.start().await.unwrap();

        let a = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.stop(Duration::from_secs(5)).await })
        };
        let b = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.stop(Duration::from_secs(5)).await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.is_ok() || b.is_ok());
        for res in [a, b] {
            if let Err(e) = res {
                // The loser may find the worker gone before it can signal.
                assert!(matches!(e, SupervisorError::Signal(_)), "unexpected error: {}", e);
            }
        }
        assert!(!sup.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_update_config_racing_start() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("stdin.log");
        let script = format!("cat > {}; exec sleep 30", capture.display());
        let sup = Arc::new(sh_supervisor(&script, "old"));

        let updater = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.update_config("new") })
        };
        let starter = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.start().await })
        };
        updater.await.unwrap();
        starter.await.unwrap().unwrap();

        // Whichever won the lock, the worker saw one whole blob.
        let seen = read_when(&capture, Duration::from_secs(2), |c| c == "old" || c == "new").await;
        assert!(seen == "old" || seen == "new", "worker saw {:?}", seen);
        assert_eq!(sup.config(), "new");

        sup.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_stop_failure_leaves_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let script = format!("echo x >> {}; trap '' TERM; exec sleep 30", marker.display());
        let sup = sh_supervisor(&script, "{}");
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = sup.restart(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::DeadlineExceeded(_)));
        assert!(!sup.is_running());
        assert!(sup.last_exit().unwrap().is_signal(Signal::SIGKILL));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let spawned = tokio::fs::read_to_string(&marker).await.unwrap();
        assert_eq!(spawned.lines().count(), 1, "a failed stop must not be followed by a start");
    }

    #[tokio::test]
    async fn test_restart_after_self_exit_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let sup = sh_supervisor(&format!("echo x >> {}; exit 0", marker.display()), "{}");
        sup.start().await.unwrap();
        assert!(wait_until_stopped(&sup, Duration::from_secs(2)).await);

        let err = sup.restart(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning));
        assert!(!sup.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let spawned = tokio::fs::read_to_string(&marker).await.unwrap();
        assert_eq!(spawned.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_stop_reports_undeliverable_signal() {
        let sup = sh_supervisor("exec sleep 30", "{}");
        // A handle whose watcher is already gone: the child was reaped, so the
        // signal must not go anywhere.
        let (signals, gone) = mpsc::channel(1);
        drop(gone);
        let (_exited_tx, exited) = watch::channel(None);
        sup.lock().handle = Some(WorkerHandle {
            pid: Pid::from_raw(i32::MAX),
            exited,
            signals,
            stop_requested: false,
        });

        let err = sup.stop(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Signal(nix::errno::Errno::ESRCH)));
    }

    #[test]
    fn test_worker_killed_when_runtime_drops() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let sup = sh_supervisor("exec sleep 30", "{}");
        let pid = rt.block_on(async {
            sup.start().await.unwrap();
            sup.pid().unwrap()
        });
        drop(rt);

        // The watcher owned the child; dropping it must take the worker down.
        let stat = format!("/proc/{}/stat", pid);
        let start = Instant::now();
        let gone = loop {
            let dead = match std::fs::read_to_string(&stat) {
                Err(_) => true,
                Ok(line) => line
                    .rsplit_once(')')
                    .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                    .unwrap_or(false),
            };
            if dead || start.elapsed() > Duration::from_secs(2) {
                break dead;
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        assert!(gone, "worker {} outlived the supervisor runtime", pid);
    }
}
