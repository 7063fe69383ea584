//! Per-service supervisor: drives the lifecycle state machine, owns the
//! child process and its health checker, and applies the restart policy.
//!
//! One supervisor task runs per service. It processes one event at a
//! time, so transitions for a single service are serialized. Every async
//! collaborator (probe, timer, wait) carries the generation it was born
//! under; events from an older generation are dropped on arrival.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{EventBus, Reason, TransitionEvent};
use crate::health::{spawn_checker, HealthEvent, HealthSignal};
use crate::logs::LogRedirector;
use crate::runner::{self, ExitStatus, RunningChild, StdioPolicy};
use crate::service::{ServiceRuntime, ServiceSpec, ServiceState, StatusBoard};

/// Commands delivered to a supervisor task.
#[derive(Debug)]
pub enum Command {
    /// Scheduler releases the service (Pending -> WaitingDeps)
    Release,
    /// Every prerequisite is healthy (WaitingDeps -> Delaying)
    DepsReady,
    /// A prerequisite ended in a terminal failure
    DepFailed { dependency: String },
    /// Terminate the child within `grace`, then force-kill
    Stop {
        grace: Duration,
        done: Option<oneshot::Sender<()>>,
    },
    /// Cycle the service through Stopping into a new generation
    Restart,
}

/// Restart policy tunables.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// First backoff step
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_cap: Duration,
    /// Restarts allowed inside the rolling window before Failed
    pub budget_max: u32,
    /// Rolling window for the failure budget
    pub budget_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            budget_max: 5,
            budget_window: Duration::from_secs(60),
        }
    }
}

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub restart: RestartPolicy,
    /// How long a probe-less child must stay alive before it counts as
    /// healthy; prevents flapping on immediate exits
    pub liveness_tick: Duration,
    /// Grace used for internally initiated terminations (unhealthy
    /// restart, manual restart)
    pub stop_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            restart: RestartPolicy::default(),
            liveness_tick: Duration::from_millis(500),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Cheap handle for sending commands to a running supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    pub name: String,
    cmd_tx: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    pub async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::SupervisorGone(self.name.clone()))
    }

    /// Request a stop and wait until the supervisor acknowledges it.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Stop {
            grace,
            done: Some(done_tx),
        })
        .await?;
        // A dropped ack means the task ended; either way the service is down.
        let _ = done_rx.await;
        Ok(())
    }
}

/// Spawn the supervisor task for one service.
pub fn spawn_supervisor(
    spec: Arc<ServiceSpec>,
    opts: SupervisorOptions,
    board: StatusBoard,
    events: EventBus,
    cancel: CancellationToken,
) -> SupervisorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let name = spec.name.clone();
    let backoff = opts.restart.backoff_base;
    let redirector = spec.log_redirect.then(|| {
        LogRedirector::new(
            &spec.name,
            spec.log_dir.join(format!("{}.log", spec.name)),
            spec.log_max_size,
            spec.log_keep,
        )
    });
    let supervisor = ServiceSupervisor {
        spec,
        opts,
        runtime: ServiceRuntime::new(),
        board,
        events,
        cancel,
        cmd_rx,
        child: None,
        redirector,
        health_rx: None,
        health_cancel: None,
        backoff,
        restart_times: VecDeque::new(),
        shutting_down: false,
    };
    tokio::spawn(supervisor.run());
    SupervisorHandle { name, cmd_tx }
}

struct ServiceSupervisor {
    spec: Arc<ServiceSpec>,
    opts: SupervisorOptions,
    runtime: ServiceRuntime,
    board: StatusBoard,
    events: EventBus,
    cancel: CancellationToken,
    cmd_rx: mpsc::Receiver<Command>,
    child: Option<RunningChild>,
    redirector: Option<LogRedirector>,
    health_rx: Option<mpsc::Receiver<HealthEvent>>,
    health_cancel: Option<CancellationToken>,
    backoff: Duration,
    restart_times: VecDeque<Instant>,
    shutting_down: bool,
}

/// What woke the supervisor while a child is running.
enum Wake {
    Exited(ExitStatus),
    Health(HealthEvent),
    HealthClosed,
    Settled,
    Cmd(Option<Command>),
    Cancelled,
}

impl ServiceSupervisor {
    async fn run(mut self) {
        self.publish_snapshot().await;
        loop {
            match self.runtime.state {
                ServiceState::Pending => self.run_pending().await,
                ServiceState::WaitingDeps => self.run_waiting_deps().await,
                ServiceState::Delaying => self.run_delaying().await,
                ServiceState::Starting => self.run_starting().await,
                ServiceState::Probing | ServiceState::Healthy | ServiceState::Unhealthy => {
                    self.run_supervised().await
                }
                ServiceState::Restarting => self.run_restarting().await,
                ServiceState::Stopping => {
                    // Normally handled inline; recover defensively.
                    self.perform_stop(self.opts.stop_grace, None, false).await;
                }
                ServiceState::Stopped | ServiceState::Failed => {
                    if !self.run_terminal().await {
                        break;
                    }
                }
            }
        }
        debug!(service = %self.spec.name, "supervisor task finished");
    }

    async fn run_pending(&mut self) {
        tokio::select! {
            cmd = self.cmd_rx.recv() => match cmd {
                Some(Command::Release) => {
                    self.transition(ServiceState::WaitingDeps, Reason::Released).await;
                }
                Some(Command::Stop { done, .. }) => self.stop_idle(done).await,
                Some(_) => {}
                None => self.stop_idle(None).await,
            },
            _ = self.cancel.cancelled() => {
                self.transition(ServiceState::Stopped, Reason::Cancelled).await;
            }
        }
    }

    async fn run_waiting_deps(&mut self) {
        tokio::select! {
            cmd = self.cmd_rx.recv() => match cmd {
                Some(Command::DepsReady) => {
                    self.transition(ServiceState::Delaying, Reason::DepsHealthy).await;
                }
                Some(Command::DepFailed { dependency }) => {
                    warn!(
                        service = %self.spec.name,
                        dependency = %dependency,
                        "prerequisite failed, service will not start"
                    );
                    self.transition(ServiceState::Failed, Reason::DepFailed(dependency)).await;
                }
                Some(Command::Stop { done, .. }) => self.stop_idle(done).await,
                Some(_) => {}
                None => self.stop_idle(None).await,
            },
            _ = self.cancel.cancelled() => {
                self.transition(ServiceState::Stopped, Reason::Cancelled).await;
            }
        }
    }

    async fn run_delaying(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.spec.startup_delay) => {
                self.transition(ServiceState::Starting, Reason::DelayElapsed).await;
            }
            cmd = self.cmd_rx.recv() => match cmd {
                Some(Command::Stop { done, .. }) => self.stop_idle(done).await,
                Some(_) => {}
                None => self.stop_idle(None).await,
            },
            _ = self.cancel.cancelled() => {
                self.transition(ServiceState::Stopped, Reason::Cancelled).await;
            }
        }
    }

    async fn run_starting(&mut self) {
        self.runtime.generation += 1;
        let stdio = if self.spec.log_redirect {
            StdioPolicy::Piped
        } else {
            StdioPolicy::Inherit
        };
        match runner::spawn(&self.spec, stdio) {
            Ok(mut child) => {
                info!(
                    service = %self.spec.name,
                    pid = child.pid,
                    generation = self.runtime.generation,
                    "service started"
                );
                self.runtime.pid = Some(child.pid);
                self.write_pid_file(child.pid);
                if let Some(redirector) = &self.redirector {
                    if let (Some(out), Some(err)) = (child.take_stdout(), child.take_stderr()) {
                        redirector.attach(out, err);
                    }
                }
                self.start_health_checker(child.pid);
                self.child = Some(child);
                self.transition(ServiceState::Probing, Reason::Spawned).await;
            }
            Err(e) => {
                error!(service = %self.spec.name, error = %e, "spawn failed");
                self.decide_failure(Reason::SpawnFailed(e.to_string())).await;
            }
        }
    }

    async fn run_supervised(&mut self) {
        // Probe-less services settle into Healthy after one tick alive.
        let mut settle = (self.spec.probe.is_none()
            && self.runtime.state == ServiceState::Probing)
            .then(|| Box::pin(tokio::time::sleep(self.opts.liveness_tick)));

        loop {
            if self.child.is_none() {
                // Child handle lost without an exit record; fail safe.
                self.decide_failure(Reason::ChildExited("handle lost".to_string()))
                    .await;
                return;
            }
            let wake = {
                let Self {
                    child,
                    health_rx,
                    cmd_rx,
                    cancel,
                    shutting_down,
                    ..
                } = &mut *self;
                tokio::select! {
                    status = async {
                        match child.as_mut() {
                            Some(child) => child.wait().await,
                            None => std::future::pending().await,
                        }
                    } => Wake::Exited(status),
                    ev = async {
                        match health_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => match ev {
                        Some(ev) => Wake::Health(ev),
                        None => Wake::HealthClosed,
                    },
                    _ = async {
                        match settle.as_mut() {
                            Some(sleep) => sleep.as_mut().await,
                            None => std::future::pending().await,
                        }
                    } => Wake::Settled,
                    cmd = cmd_rx.recv() => Wake::Cmd(cmd),
                    _ = cancel.cancelled(), if !*shutting_down => Wake::Cancelled,
                }
            };

            match wake {
                Wake::Exited(status) => {
                    self.on_child_exit(status).await;
                    return;
                }
                Wake::Health(ev) => {
                    if !self.on_health_event(ev).await {
                        return;
                    }
                }
                Wake::HealthClosed => {
                    self.health_rx = None;
                }
                Wake::Settled => {
                    settle = None;
                    self.transition(ServiceState::Healthy, Reason::ProbePassed).await;
                }
                Wake::Cmd(Some(Command::Stop { grace, done })) => {
                    self.transition(ServiceState::Stopping, Reason::StopRequested).await;
                    self.perform_stop(grace, done, false).await;
                    return;
                }
                Wake::Cmd(Some(Command::Restart)) => {
                    self.transition(ServiceState::Stopping, Reason::RestartRequested).await;
                    self.perform_stop(self.opts.stop_grace, None, true).await;
                    return;
                }
                Wake::Cmd(Some(_)) => {}
                Wake::Cmd(None) => {
                    self.transition(ServiceState::Stopping, Reason::StopRequested).await;
                    self.perform_stop(self.opts.stop_grace, None, false).await;
                    return;
                }
                Wake::Cancelled => {
                    // Shutdown has begun. Timers and probes stop now; the
                    // child keeps running until the scheduler sends the
                    // ordered Stop.
                    self.shutting_down = true;
                    self.cancel_health();
                    settle = None;
                }
            }
        }
    }

    async fn run_restarting(&mut self) {
        let delay = self.backoff;
        self.backoff = std::cmp::min(delay * 2, self.opts.restart.backoff_cap);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                self.transition(ServiceState::Starting, Reason::BackoffElapsed).await;
            }
            cmd = self.cmd_rx.recv() => match cmd {
                Some(Command::Stop { done, .. }) => self.stop_idle(done).await,
                Some(_) => {}
                None => self.stop_idle(None).await,
            },
            _ = self.cancel.cancelled() => {
                self.transition(ServiceState::Stopped, Reason::Cancelled).await;
            }
        }
    }

    /// Terminal states keep answering commands so shutdown acks and manual
    /// restarts still work. Returns false when the command channel closes.
    async fn run_terminal(&mut self) -> bool {
        match self.cmd_rx.recv().await {
            Some(Command::Stop { done, .. }) => {
                if let Some(done) = done {
                    let _ = done.send(());
                }
                true
            }
            Some(Command::Restart) if !self.shutting_down => {
                self.restart_times.clear();
                self.backoff = self.opts.restart.backoff_base;
                self.runtime.consecutive_failures = 0;
                self.transition(ServiceState::Restarting, Reason::RestartRequested)
                    .await;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    async fn on_child_exit(&mut self, status: ExitStatus) {
        warn!(
            service = %self.spec.name,
            pid = ?self.runtime.pid,
            status = %status,
            uptime_secs = status.duration.as_secs_f64(),
            "child exited"
        );
        self.clear_child(&status);
        if self.shutting_down {
            self.transition(ServiceState::Stopped, Reason::ChildExited(status.to_string()))
                .await;
        } else {
            self.decide_failure(Reason::ChildExited(status.to_string()))
                .await;
        }
    }

    /// Returns false when the service left the running cluster.
    async fn on_health_event(&mut self, ev: HealthEvent) -> bool {
        if ev.generation != self.runtime.generation {
            debug!(
                service = %self.spec.name,
                event_generation = ev.generation,
                current_generation = self.runtime.generation,
                "dropping stale probe event"
            );
            return true;
        }
        self.runtime.consecutive_failures = ev.failures;
        match ev.signal {
            HealthSignal::Healthy => {
                self.backoff = self.opts.restart.backoff_base;
                if self.runtime.state != ServiceState::Healthy {
                    self.transition(ServiceState::Healthy, Reason::ProbePassed).await;
                } else {
                    self.publish_snapshot().await;
                }
                true
            }
            HealthSignal::Heartbeat => {
                self.publish_snapshot().await;
                true
            }
            HealthSignal::Unhealthy => {
                warn!(
                    service = %self.spec.name,
                    failures = ev.failures,
                    "health check failure threshold reached"
                );
                if self.spec.restart {
                    self.cancel_health();
                    if let Some(mut child) = self.child.take() {
                        let status = child.terminate(self.opts.stop_grace).await;
                        self.clear_child(&status);
                    }
                    self.decide_failure(Reason::ProbeFailed).await;
                    false
                } else {
                    if self.runtime.state != ServiceState::Unhealthy {
                        self.transition(ServiceState::Unhealthy, Reason::ProbeFailed).await;
                    } else {
                        self.publish_snapshot().await;
                    }
                    true
                }
            }
        }
    }

    /// Restart policy: enter Restarting while the failure budget lasts,
    /// Failed once it is exhausted or restart is disabled.
    async fn decide_failure(&mut self, reason: Reason) {
        if self.shutting_down {
            self.transition(ServiceState::Stopped, reason).await;
            return;
        }
        if !self.spec.restart {
            self.transition(ServiceState::Failed, reason).await;
            return;
        }
        let now = Instant::now();
        self.restart_times.push_back(now);
        let window = self.opts.restart.budget_window;
        while let Some(front) = self.restart_times.front() {
            if now.duration_since(*front) > window {
                self.restart_times.pop_front();
            } else {
                break;
            }
        }
        if self.restart_times.len() as u32 > self.opts.restart.budget_max {
            error!(
                service = %self.spec.name,
                restarts = self.restart_times.len(),
                window_secs = window.as_secs(),
                "restart budget exhausted"
            );
            self.transition(ServiceState::Failed, Reason::BudgetExhausted).await;
        } else {
            self.transition(ServiceState::Restarting, reason).await;
        }
    }

    /// Stop from a state with no live child: pass through Stopping so
    /// observers see the documented edge.
    async fn stop_idle(&mut self, done: Option<oneshot::Sender<()>>) {
        self.cancel_health();
        self.transition(ServiceState::Stopping, Reason::StopRequested).await;
        self.transition(ServiceState::Stopped, Reason::StopComplete).await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    async fn perform_stop(
        &mut self,
        grace: Duration,
        done: Option<oneshot::Sender<()>>,
        restart_after: bool,
    ) {
        self.cancel_health();
        if let Some(mut child) = self.child.take() {
            let status = child.terminate(grace).await;
            info!(service = %self.spec.name, status = %status, "service stopped");
            self.clear_child(&status);
        }
        if restart_after {
            self.backoff = self.opts.restart.backoff_base;
            self.transition(ServiceState::Restarting, Reason::RestartRequested)
                .await;
        } else {
            self.transition(ServiceState::Stopped, Reason::StopComplete).await;
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn clear_child(&mut self, status: &ExitStatus) {
        self.child = None;
        self.runtime.pid = None;
        self.runtime.last_exit = Some(status.summary());
        self.cancel_health();
        self.remove_pid_file();
    }

    fn start_health_checker(&mut self, pid: u32) {
        let Some(probe) = &self.spec.probe else {
            return;
        };
        let (tx, rx) = mpsc::channel(16);
        let token = self.cancel.child_token();
        spawn_checker(
            self.spec.name.clone(),
            probe.clone(),
            pid,
            self.runtime.generation,
            tx,
            token.clone(),
        );
        self.health_rx = Some(rx);
        self.health_cancel = Some(token);
    }

    fn cancel_health(&mut self) {
        if let Some(token) = self.health_cancel.take() {
            token.cancel();
        }
        self.health_rx = None;
    }

    fn write_pid_file(&self, pid: u32) {
        let path = self.spec.data_dir.join("pid");
        let result = std::fs::create_dir_all(&self.spec.data_dir)
            .and_then(|_| std::fs::write(&path, pid.to_string()));
        if let Err(e) = result {
            error!(service = %self.spec.name, error = %e, "failed to write pid file");
        }
    }

    fn remove_pid_file(&self) {
        let path = self.spec.data_dir.join("pid");
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(service = %self.spec.name, error = %e, "failed to remove pid file");
            }
        }
    }

    async fn transition(&mut self, to: ServiceState, reason: Reason) {
        let from = self.runtime.state;
        if from == to {
            return;
        }
        self.runtime.state = to;
        info!(
            service = %self.spec.name,
            from = %from,
            to = %to,
            generation = self.runtime.generation,
            "state changed"
        );
        self.events.publish(TransitionEvent::new(
            &self.spec.name,
            from,
            to,
            self.runtime.generation,
            reason,
        ));
        self.publish_snapshot().await;
    }

    async fn publish_snapshot(&self) {
        self.board
            .publish(self.runtime.snapshot(&self.spec.name))
            .await;
    }
}
