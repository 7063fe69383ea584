//! Control plane: the narrow command surface over the scheduler, plus
//! the on-disk artifacts the CLI and OS-service adapter rely on — the
//! supervisor pid file and the status snapshot file.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::health::probe_process;
use crate::paths::Paths;
use crate::scheduler::Scheduler;
use crate::service::ServiceSnapshot;

/// Aggregate snapshot persisted for the `status` CLI command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub updated_at: DateTime<Utc>,
    pub services: Vec<ServiceSnapshot>,
}

/// Command surface exposed to the CLI and the OS-service adapter.
#[derive(Clone)]
pub struct ControlPlane {
    scheduler: Arc<Scheduler>,
    paths: Paths,
}

impl ControlPlane {
    pub fn new(scheduler: Arc<Scheduler>, paths: Paths) -> Self {
        Self { scheduler, paths }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Kick the scheduler; returns once every service is past startup
    /// (healthy or failed). Idempotent.
    pub async fn start_all(&self) -> Result<()> {
        self.scheduler.start_all().await
    }

    /// Reverse-order shutdown; returns when it completes or the hard cap
    /// fires. Idempotent.
    pub async fn stop_all(&self, grace: Duration) -> Result<()> {
        self.scheduler.stop_all(grace).await?;
        self.write_status_file().await;
        Ok(())
    }

    pub async fn status(&self) -> Vec<ServiceSnapshot> {
        self.scheduler.status().await
    }

    /// Queue a restart of a single service.
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.scheduler.restart(name).await
    }

    /// Keep `{app_data_home}/status.json` current: rewritten atomically on
    /// every transition so an external `status` invocation reads a
    /// consistent snapshot.
    pub fn spawn_status_writer(&self) -> JoinHandle<()> {
        let plane = self.clone();
        let mut rx = self.scheduler.events().subscribe();
        tokio::spawn(async move {
            plane.write_status_file().await;
            loop {
                match rx.recv().await {
                    Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        plane.write_status_file().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn write_status_file(&self) {
        let report = StatusReport {
            updated_at: Utc::now(),
            services: self.scheduler.status().await,
        };
        if let Err(e) = write_report(&self.paths, &report) {
            warn!(error = %e, "failed to write status snapshot");
        }
    }
}

fn write_report(paths: &Paths, report: &StatusReport) -> Result<()> {
    std::fs::create_dir_all(&paths.app_data_home)?;
    let target = paths.status_file();
    let tmp = target.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(report)?)?;
    std::fs::rename(&tmp, &target)?;
    Ok(())
}

/// Read the persisted snapshot; `Err(NotRunning)` when no live supervisor
/// owns the app data home.
pub fn read_status_report(paths: &Paths) -> Result<StatusReport> {
    if running_supervisor_pid(paths).is_none() {
        return Err(Error::NotRunning);
    }
    let contents = std::fs::read_to_string(paths.status_file())?;
    Ok(serde_json::from_str(&contents)?)
}

/// Pid recorded in the supervisor pid file, if that process is alive.
pub fn running_supervisor_pid(paths: &Paths) -> Option<u32> {
    let contents = std::fs::read_to_string(paths.supervisor_pid_file()).ok()?;
    let pid: u32 = contents.trim().parse().ok()?;
    probe_process(pid).then_some(pid)
}

/// Claim the supervisor pid file, refusing when another live instance
/// already holds it. Stale files from dead processes are replaced.
pub fn acquire_pid_file(paths: &Paths) -> Result<()> {
    if let Some(pid) = running_supervisor_pid(paths) {
        return Err(Error::AlreadyRunning(pid));
    }
    std::fs::create_dir_all(&paths.app_data_home)?;
    std::fs::write(paths.supervisor_pid_file(), std::process::id().to_string())?;
    Ok(())
}

/// Drop the pid file on clean exit; best effort.
pub fn release_pid_file(paths: &Paths) {
    let path = paths.supervisor_pid_file();
    if path.exists() {
        if let Err(e) = std::fs::remove_file(&path) {
            debug!(error = %e, "failed to remove supervisor pid file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(dir: &TempDir) -> Paths {
        Paths::new(dir.path().to_path_buf(), dir.path().join("data"))
    }

    #[test]
    fn pid_file_guards_double_start() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);

        acquire_pid_file(&paths).unwrap();
        // Our own pid is alive, so a second claim must fail.
        let err = acquire_pid_file(&paths).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));

        release_pid_file(&paths);
        acquire_pid_file(&paths).unwrap();
    }

    #[test]
    fn stale_pid_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        std::fs::create_dir_all(&paths.app_data_home).unwrap();
        // No live process reads as not running.
        std::fs::write(paths.supervisor_pid_file(), "4294967294").unwrap();
        assert!(running_supervisor_pid(&paths).is_none());
        acquire_pid_file(&paths).unwrap();
    }

    #[test]
    fn status_read_requires_running_supervisor() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        assert!(matches!(
            read_status_report(&paths),
            Err(Error::NotRunning)
        ));
    }

    #[test]
    fn report_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        acquire_pid_file(&paths).unwrap();
        let report = StatusReport {
            updated_at: Utc::now(),
            services: Vec::new(),
        };
        write_report(&paths, &report).unwrap();
        let read = read_status_report(&paths).unwrap();
        assert!(read.services.is_empty());
    }
}
