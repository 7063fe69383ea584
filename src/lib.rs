//! Container-less process supervisor.
//!
//! Launches a declared set of long-running processes, enforces startup
//! ordering by declared dependencies, monitors liveness through
//! configurable health checks, and brings the fleet up and down as one
//! logical application. It targets developer machines and small
//! deployments where a container orchestrator would be overkill.
//!
//! # Architecture
//!
//! - **Runner**: spawns one child per service in its own process group
//!   and terminates it with escalation
//! - **LogRedirector**: pipes child output into per-service rotating logs
//! - **HealthChecker**: probes a service (process/http/tcp/cmd) on its
//!   interval and reports generation-tagged verdicts
//! - **ServiceSupervisor**: one per service; drives the lifecycle state
//!   machine and the restart policy
//! - **Scheduler**: releases supervisors as prerequisites turn healthy
//!   and coordinates reverse-order shutdown
//! - **ControlPlane**: start/stop/status/restart surface for the CLI and
//!   the OS-service adapter
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use process_compose::{
//!     ControlPlane, EventBus, GlobalConfig, Paths, Scheduler, StatusBoard,
//!     SupervisorOptions,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GlobalConfig::load(std::path::Path::new("config.yaml"))?;
//!     let paths = Paths::new(".".into(), config.app_data_home.clone().into());
//!     let specs = config.service_specs(&paths)?;
//!     let scheduler = Arc::new(Scheduler::new(
//!         specs,
//!         SupervisorOptions::default(),
//!         StatusBoard::new(),
//!         EventBus::default(),
//!         CancellationToken::new(),
//!     )?);
//!     let control = ControlPlane::new(scheduler, paths);
//!     control.start_all().await?;
//!     control.stop_all(Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod health;
pub mod logs;
pub mod paths;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod supervisor;
pub mod sys_service;

pub use config::{GlobalConfig, HealthcheckConfig, ServiceConfig, TestType};
pub use control::{ControlPlane, StatusReport};
pub use error::{Error, Result};
pub use event::{EventBus, Reason, TransitionEvent};
pub use health::{HealthEvent, HealthSignal, ProbeKind, ProbeSettings};
pub use logs::LogRedirector;
pub use paths::Paths;
pub use runner::{ExitStatus, RunningChild, StdioPolicy};
pub use scheduler::{Scheduler, ServiceGraph};
pub use service::{ServiceSnapshot, ServiceSpec, ServiceState, StatusBoard};
pub use supervisor::{RestartPolicy, SupervisorHandle, SupervisorOptions};
