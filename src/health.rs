//! Health checking for supervised services.
//!
//! One checker task runs per service generation. It fires the configured
//! probe on its interval, keeps a rolling failure counter, and reports
//! verdicts to the owning supervisor over a channel. Every event carries
//! the generation the checker was born under so the supervisor can drop
//! reports that outlived their child.

use std::process::Stdio;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    /// The child pid is still alive
    Process,
    /// GET returns 2xx within the timeout
    Http { url: String },
    /// TCP connect succeeds within the timeout
    Tcp { addr: String },
    /// Shell command exits 0 within the timeout
    Cmd { command: String },
}

/// Resolved probe configuration for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    pub kind: ProbeKind,
    pub timeout: Duration,
    pub interval: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

impl ProbeSettings {
    pub fn process() -> Self {
        Self {
            kind: ProbeKind::Process,
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(10),
            retries: 3,
            start_period: Duration::ZERO,
        }
    }
}

/// Verdict reported to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    /// First success of this generation, or recovery after unhealthy
    Healthy,
    /// Success or sub-threshold failure; observability only
    Heartbeat,
    /// Failure counter reached the retries threshold
    Unhealthy,
}

/// Event emitted by a checker task.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub generation: u64,
    pub signal: HealthSignal,
    /// Probe failures since the last success
    pub failures: u32,
}

/// Spawn the checker task for one service generation.
///
/// The task ends when `cancel` trips; the supervisor cancels it before
/// every respawn and on shutdown.
pub fn spawn_checker(
    service: String,
    settings: ProbeSettings,
    pid: u32,
    generation: u64,
    events: mpsc::Sender<HealthEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let checker = HealthChecker {
        service,
        settings,
        pid,
        generation,
        events,
        cancel,
        http: None,
    };
    tokio::spawn(checker.run())
}

struct HealthChecker {
    service: String,
    settings: ProbeSettings,
    pid: u32,
    generation: u64,
    events: mpsc::Sender<HealthEvent>,
    cancel: CancellationToken,
    http: Option<reqwest::Client>,
}

impl HealthChecker {
    async fn run(mut self) {
        if let ProbeKind::Http { .. } = self.settings.kind {
            match reqwest::Client::builder()
                .timeout(self.settings.timeout)
                .build()
            {
                Ok(client) => self.http = Some(client),
                Err(e) => {
                    warn!(service = %self.service, error = %e, "failed to build http probe client");
                }
            }
        }

        if !self.sleep_or_cancel(self.settings.start_period).await {
            return;
        }

        let mut failures: u32 = 0;
        let mut seen_success = false;
        let mut above_threshold = false;

        loop {
            let ok = tokio::select! {
                ok = self.probe_once() => ok,
                _ = self.cancel.cancelled() => return,
            };

            let event = if ok {
                failures = 0;
                let signal = if !seen_success || above_threshold {
                    HealthSignal::Healthy
                } else {
                    HealthSignal::Heartbeat
                };
                seen_success = true;
                above_threshold = false;
                HealthEvent {
                    generation: self.generation,
                    signal,
                    failures,
                }
            } else {
                failures = failures.saturating_add(1);
                let signal = if failures >= self.settings.retries && !above_threshold {
                    above_threshold = true;
                    HealthSignal::Unhealthy
                } else {
                    HealthSignal::Heartbeat
                };
                HealthEvent {
                    generation: self.generation,
                    signal,
                    failures,
                }
            };

            debug!(
                service = %self.service,
                generation = self.generation,
                failures,
                ok,
                "probe finished"
            );
            if self.events.send(event).await.is_err() {
                // Supervisor is gone; nothing left to report to.
                return;
            }

            if !self.sleep_or_cancel(self.settings.interval).await {
                return;
            }
        }
    }

    /// Returns false when cancelled during the sleep.
    async fn sleep_or_cancel(&self, dur: Duration) -> bool {
        if dur.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Run one probe. A probe that outlives its deadline is cancelled and
    /// counts as a single failure.
    async fn probe_once(&self) -> bool {
        let deadline = self.settings.timeout;
        match &self.settings.kind {
            ProbeKind::Process => probe_process(self.pid),
            ProbeKind::Http { url } => match &self.http {
                Some(client) => {
                    match tokio::time::timeout(deadline, probe_http(client, url)).await {
                        Ok(ok) => ok,
                        Err(_) => false,
                    }
                }
                None => false,
            },
            ProbeKind::Tcp { addr } => {
                match tokio::time::timeout(deadline, probe_tcp(addr)).await {
                    Ok(ok) => ok,
                    Err(_) => false,
                }
            }
            ProbeKind::Cmd { command } => {
                match tokio::time::timeout(deadline, probe_cmd(command)).await {
                    Ok(ok) => ok,
                    Err(_) => false,
                }
            }
        }
    }
}

/// Liveness of a pid, as seen by the OS process table.
pub fn probe_process(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_process(pid);
    sys.process(pid).is_some()
}

async fn probe_http(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

async fn probe_tcp(addr: &str) -> bool {
    tokio::net::TcpStream::connect(addr).await.is_ok()
}

async fn probe_cmd(command: &str) -> bool {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match cmd.status().await {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}
