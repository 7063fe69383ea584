//! OS-service adapter: a thin boundary between the host init system
//! (systemd / Windows SCM) and the control plane.
//!
//! The host's start/stop callbacks must be acknowledged within the
//! platform deadline, so the long work is delegated to the control plane
//! asynchronously by the [`SysServiceProgram`] implementation.

#[cfg(unix)]
mod linux;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use self::linux as platform;
#[cfg(windows)]
use self::windows as platform;

use anyhow::Context;
use service_manager::{
    ServiceLabel, ServiceManager, ServiceStartCtx, ServiceStopCtx, ServiceUninstallCtx,
};

/// Argument marking an invocation launched by the host service manager.
pub const RUN_AS_SERVICE_ARG: &str = "run-as-service";

/// Identity under which the supervisor registers with the host.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub name: String,
    pub description: String,
}

/// The long-running program driven by host start/stop callbacks.
pub trait SysServiceProgram: Send + Sync {
    /// Begin supervision; must return promptly.
    fn start(&self) -> anyhow::Result<()>;
    /// Stop every service and release resources.
    fn stop(&self) -> anyhow::Result<()>;
}

/// Host-level action requested from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Install,
    Uninstall,
    Start,
    Stop,
}

/// Run under the host service manager until it asks us to stop.
pub fn run(settings: &ServiceSettings, program: Box<dyn SysServiceProgram>) -> anyhow::Result<()> {
    platform::run(settings, program)
}

/// Dispatch a host-level service action.
pub fn control(action: ServiceAction, settings: &ServiceSettings) -> anyhow::Result<()> {
    match action {
        ServiceAction::Install => platform::install(settings),
        ServiceAction::Uninstall => {
            let (manager, label) = native_manager(settings)?;
            manager
                .uninstall(ServiceUninstallCtx { label })
                .context("failed to uninstall service")
        }
        ServiceAction::Start => {
            let (manager, label) = native_manager(settings)?;
            manager
                .start(ServiceStartCtx { label })
                .context("failed to start service")
        }
        ServiceAction::Stop => {
            let (manager, label) = native_manager(settings)?;
            manager
                .stop(ServiceStopCtx { label })
                .context("failed to stop service")
        }
    }
}

fn native_manager(
    settings: &ServiceSettings,
) -> anyhow::Result<(Box<dyn ServiceManager>, ServiceLabel)> {
    let label = parse_label(&settings.name)?;
    let manager =
        <dyn ServiceManager>::native().context("failed to detect a service management platform")?;
    Ok((manager, label))
}

pub(crate) fn parse_label(name: &str) -> anyhow::Result<ServiceLabel> {
    name.parse::<ServiceLabel>()
        .map_err(|e| anyhow::anyhow!("invalid service name {:?}: {}", name, e))
}
