//! Service definitions, lifecycle states, and published runtime snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::health::ProbeSettings;

/// Lifecycle state of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Known to the scheduler, not yet released
    Pending,
    /// Released; waiting for every prerequisite to become healthy
    WaitingDeps,
    /// Prerequisites healthy; waiting out the configured startup delay
    Delaying,
    /// Spawning the child process
    Starting,
    /// Child alive; waiting for the first successful probe
    Probing,
    /// Child alive and passing its health check
    Healthy,
    /// Child alive but failing its health check (restart disabled)
    Unhealthy,
    /// Waiting out restart backoff before the next spawn
    Restarting,
    /// Terminating the child
    Stopping,
    /// Terminated by the supervisor
    Stopped,
    /// Restart policy exhausted or startup impossible
    Failed,
}

impl ServiceState {
    /// Terminal states are only entered during shutdown or after the
    /// restart policy is exhausted.
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Pending => "pending",
            ServiceState::WaitingDeps => "waiting-deps",
            ServiceState::Delaying => "delaying",
            ServiceState::Starting => "starting",
            ServiceState::Probing => "probing",
            ServiceState::Healthy => "healthy",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Restarting => "restarting",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Immutable per-service definition, resolved from configuration at load.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unique name; key of the services map
    pub name: String,
    /// Working directory for the child, sibling to the supervisor binary
    pub work_dir: PathBuf,
    /// Command line, argv[0] first; never empty
    pub start_cmd: Vec<String>,
    /// Extra environment for the child
    pub environment: HashMap<String, String>,
    /// Redirect child stdout/stderr into the per-service log file
    pub log_redirect: bool,
    /// Directory holding the per-service log file
    pub log_dir: PathBuf,
    /// Rotate the log when it exceeds this many bytes
    pub log_max_size: u64,
    /// Number of rotated log files to keep
    pub log_keep: usize,
    /// Directory holding the per-service pid file
    pub data_dir: PathBuf,
    /// Delay between prerequisites turning healthy and the spawn
    pub startup_delay: Duration,
    /// Names of prerequisite services
    pub depends_on: Vec<String>,
    /// Health probe, if configured
    pub probe: Option<ProbeSettings>,
    /// Whether the restart policy applies on failure
    pub restart: bool,
}

/// Exit record of the most recent child termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitSummary {
    /// Exit code, if the child exited normally
    pub code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    /// Wall-clock time of the termination
    pub at: DateTime<Utc>,
}

/// Mutable per-service runtime record, owned by its supervisor.
#[derive(Debug)]
pub struct ServiceRuntime {
    pub state: ServiceState,
    /// Pid of the live child, cleared on exit
    pub pid: Option<u32>,
    /// Monotonic spawn counter; tags async events so stale ones are dropped
    pub generation: u64,
    /// Probe failures since the last success
    pub consecutive_failures: u32,
    /// Most recent child termination
    pub last_exit: Option<ExitSummary>,
}

impl ServiceRuntime {
    pub fn new() -> Self {
        Self {
            state: ServiceState::Pending,
            pid: None,
            generation: 0,
            consecutive_failures: 0,
            last_exit: None,
        }
    }

    /// Copy-on-read view published to observers outside the supervisor.
    pub fn snapshot(&self, name: &str) -> ServiceSnapshot {
        ServiceSnapshot {
            name: name.to_string(),
            state: self.state,
            pid: self.pid,
            generation: self.generation,
            consecutive_failures: self.consecutive_failures,
            last_exit: self.last_exit.clone(),
        }
    }
}

impl Default for ServiceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot of one service, published on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub generation: u64,
    pub consecutive_failures: u32,
    pub last_exit: Option<ExitSummary>,
}

/// Shared board of the latest snapshot per service.
///
/// Each entry is written only by its owning supervisor; everyone else
/// reads copies.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<HashMap<String, ServiceSnapshot>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, snapshot: ServiceSnapshot) {
        self.inner
            .write()
            .await
            .insert(snapshot.name.clone(), snapshot);
    }

    pub async fn get(&self, name: &str) -> Option<ServiceSnapshot> {
        self.inner.read().await.get(name).cloned()
    }

    /// All snapshots, sorted by service name for stable output.
    pub async fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let mut all: Vec<ServiceSnapshot> = self.inner.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ServiceState::Stopped.is_terminal());
        assert!(ServiceState::Failed.is_terminal());
        assert!(!ServiceState::Healthy.is_terminal());
        assert!(!ServiceState::Restarting.is_terminal());
    }

    #[test]
    fn state_display_round_trip() {
        assert_eq!(ServiceState::WaitingDeps.to_string(), "waiting-deps");
        assert_eq!(ServiceState::Healthy.to_string(), "healthy");
    }

    #[tokio::test]
    async fn board_publishes_latest() {
        let board = StatusBoard::new();
        let mut rt = ServiceRuntime::new();
        board.publish(rt.snapshot("db")).await;
        rt.state = ServiceState::Healthy;
        rt.pid = Some(42);
        rt.generation = 1;
        board.publish(rt.snapshot("db")).await;

        let snap = board.get("db").await.unwrap();
        assert_eq!(snap.state, ServiceState::Healthy);
        assert_eq!(snap.pid, Some(42));
        assert_eq!(board.snapshot().await.len(), 1);
    }
}
