//! Child process runner: spawn, wait, and terminate with escalation.
//!
//! At most one child exists per service at any instant; the supervisor
//! owns the handle and is the only caller of `wait`/`terminate`.

mod platform;

use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::service::{ExitSummary, ServiceSpec};

/// How the child's stdio is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioPolicy {
    /// Child shares the supervisor's stdio
    Inherit,
    /// Streams are piped out for the log redirector
    Piped,
}

/// Exit record of one child.
#[derive(Debug, Clone)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Time the child was alive
    pub duration: Duration,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_std(status: std::process::ExitStatus, duration: Duration) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            duration,
        }
    }

    pub fn summary(&self) -> ExitSummary {
        ExitSummary {
            code: self.code,
            signal: self.signal,
            at: Utc::now(),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// A live child process with its pid and spawn time.
pub struct RunningChild {
    pub pid: u32,
    child: Child,
    started: Instant,
}

impl std::fmt::Debug for RunningChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningChild")
            .field("pid", &self.pid)
            .field("started", &self.started)
            .finish()
    }
}

impl RunningChild {
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the child to exit. Resolves exactly once.
    pub async fn wait(&mut self) -> ExitStatus {
        let duration = self.started.elapsed();
        match self.child.wait().await {
            Ok(status) => ExitStatus::from_std(status, self.started.elapsed()),
            Err(e) => {
                warn!(pid = self.pid, error = %e, "wait on child failed");
                ExitStatus {
                    code: None,
                    signal: None,
                    duration,
                }
            }
        }
    }

    /// Polite termination with escalation: signal the process group, give
    /// it `grace`, then kill the whole subtree unconditionally.
    pub async fn terminate(&mut self, grace: Duration) -> ExitStatus {
        if let Err(e) = platform::terminate(self.pid) {
            warn!(pid = self.pid, error = %e, "termination signal failed");
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => ExitStatus::from_std(status, self.started.elapsed()),
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "wait on child failed");
                ExitStatus {
                    code: None,
                    signal: None,
                    duration: self.started.elapsed(),
                }
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    grace_secs = grace.as_secs_f64(),
                    "grace period expired, killing process group"
                );
                if let Err(e) = platform::kill(self.pid) {
                    warn!(pid = self.pid, error = %e, "kill failed");
                }
                self.wait().await
            }
        }
    }
}

/// Spawn the service's child process.
///
/// `argv[0]` beginning with `./` is resolved against the service work
/// dir; the work dir becomes the child's cwd when it exists. The child is
/// placed in its own process group (POSIX) or process group + console
/// group (Windows) so subtree kill is reliable.
pub fn spawn(spec: &ServiceSpec, stdio: StdioPolicy) -> Result<RunningChild> {
    let (argv0, args) = spec
        .start_cmd
        .split_first()
        .ok_or_else(|| Error::SpawnFailed {
            service: spec.name.clone(),
            source: std::io::Error::other("empty start_cmd"),
        })?;

    let program = if let Some(rel) = argv0.strip_prefix("./") {
        spec.work_dir.join(rel)
    } else {
        std::path::PathBuf::from(argv0)
    };

    let mut cmd = Command::new(&program);
    cmd.args(args);
    cmd.envs(&spec.environment);
    if spec.work_dir.is_dir() {
        cmd.current_dir(&spec.work_dir);
    }
    match stdio {
        StdioPolicy::Inherit => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
        StdioPolicy::Piped => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
    }
    platform::prepare(&mut cmd);
    // Leaked children are killed rather than orphaned.
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| Error::SpawnFailed {
        service: spec.name.clone(),
        source,
    })?;
    let pid = child.id().ok_or_else(|| Error::SpawnFailed {
        service: spec.name.clone(),
        source: std::io::Error::other("child exited before a pid could be read"),
    })?;

    debug!(service = %spec.name, pid, program = %program.display(), "spawned child");
    Ok(RunningChild {
        pid,
        child,
        started: Instant::now(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn spec(cmd: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: "test".to_string(),
            work_dir: PathBuf::from("/nonexistent-workdir"),
            start_cmd: cmd.iter().map(|s| s.to_string()).collect(),
            environment: HashMap::new(),
            log_redirect: false,
            log_dir: PathBuf::from("/tmp"),
            log_max_size: 1024,
            log_keep: 1,
            data_dir: PathBuf::from("/tmp"),
            startup_delay: Duration::ZERO,
            depends_on: Vec::new(),
            probe: None,
            restart: false,
        }
    }

    #[tokio::test]
    async fn spawn_and_wait_reports_exit_code() {
        let mut child = spawn(&spec(&["sh", "-c", "exit 7"]), StdioPolicy::Inherit).unwrap();
        let status = child.wait().await;
        assert_eq!(status.code, Some(7));
        assert!(status.signal.is_none());
    }

    #[tokio::test]
    async fn spawn_unknown_binary_fails() {
        let err = spawn(
            &spec(&["./definitely-not-a-real-binary"]),
            StdioPolicy::Inherit,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn terminate_escalates_after_grace() {
        // Child ignores SIGTERM; only the SIGKILL escalation ends it.
        let mut child = spawn(
            &spec(&["sh", "-c", "trap '' TERM; while :; do sleep 1; done"]),
            StdioPolicy::Inherit,
        )
        .unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        let status = child.terminate(Duration::from_secs(1)).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(status.signal, Some(9));
    }

    #[tokio::test]
    async fn terminate_within_grace_is_polite() {
        let mut child = spawn(&spec(&["sleep", "30"]), StdioPolicy::Inherit).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = child.terminate(Duration::from_secs(5)).await;
        assert_eq!(status.signal, Some(15));
    }

    #[tokio::test]
    async fn piped_stdio_exposes_streams() {
        let mut child = spawn(&spec(&["sh", "-c", "echo out"]), StdioPolicy::Piped).unwrap();
        assert!(child.take_stdout().is_some());
        assert!(child.take_stderr().is_some());
        let status = child.wait().await;
        assert!(status.success());
    }
}
