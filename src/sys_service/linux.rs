//! systemd-backed adapter: installation goes through the native service
//! manager; while running, termination signals from the host are the
//! stop callback.

use std::ffi::OsString;

use anyhow::Context;
use service_manager::{ServiceInstallCtx, ServiceManager};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use super::{parse_label, ServiceSettings, SysServiceProgram, RUN_AS_SERVICE_ARG};

pub fn install(settings: &ServiceSettings) -> anyhow::Result<()> {
    let label = parse_label(&settings.name)?;
    let manager =
        <dyn ServiceManager>::native().context("failed to detect a service management platform")?;
    manager
        .install(ServiceInstallCtx {
            label,
            program: std::env::current_exe()?,
            args: vec![OsString::from(format!("--{}", RUN_AS_SERVICE_ARG))],
            contents: None,
            username: None,
            working_directory: None,
            environment: None,
        })
        .context("failed to install service")?;
    Ok(())
}

pub fn run(settings: &ServiceSettings, program: Box<dyn SysServiceProgram>) -> anyhow::Result<()> {
    info!(service = %settings.name, "running under the host service manager");
    program.start()?;
    wait_for_signal()?;
    info!("host requested stop, shutting services down");
    if let Err(e) = program.stop() {
        error!(error = %e, "error while stopping services");
    }
    Ok(())
}

/// Park until SIGTERM or SIGINT arrives from the host.
fn wait_for_signal() -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        Ok::<_, std::io::Error>(())
    })?;
    Ok(())
}
