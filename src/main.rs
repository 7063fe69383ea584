//! Supervisor binary: foreground runner, OS-service mode, and the
//! host-level service control commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use process_compose::control::{self, ControlPlane};
use process_compose::error::{exit_code, Error};
use process_compose::event::EventBus;
use process_compose::paths::{self, Paths};
use process_compose::service::StatusBoard;
use process_compose::supervisor::SupervisorOptions;
use process_compose::sys_service::{self, ServiceAction, ServiceSettings, SysServiceProgram};
use process_compose::{GlobalConfig, Scheduler, ServiceSnapshot, StatusReport};

/// Grace given to each service during fleet shutdown.
const STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "process-compose",
    about = "Container-less process supervisor",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Internal: set by the host service manager
    #[arg(long, hide = true, default_value_t = false)]
    run_as_service: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register with the host service manager
    Install,
    /// Unregister from the host service manager
    Uninstall,
    /// Ask the host service manager to start the supervisor
    Start,
    /// Ask the host service manager to stop the supervisor
    Stop,
    /// Print the status snapshot of a running supervisor
    Status,
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let config_path = match paths::config_path() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("cannot locate configuration: {}", e);
            return exit_code::CONFIG;
        }
    };
    let config = match GlobalConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return e.exit_code();
        }
    };
    let root_dir = match paths::binary_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("cannot locate binary directory: {}", e);
            return exit_code::GENERIC;
        }
    };
    let paths = Paths::new(root_dir, PathBuf::from(&config.app_data_home));

    match cli.command {
        Some(Commands::Status) => return cmd_status(&paths),
        Some(ref cmd) => {
            let action = match cmd {
                Commands::Install => ServiceAction::Install,
                Commands::Uninstall => ServiceAction::Uninstall,
                Commands::Start => ServiceAction::Start,
                Commands::Stop => ServiceAction::Stop,
                Commands::Status => unreachable!("handled above"),
            };
            return cmd_service_control(action, &config);
        }
        None => {}
    }

    init_logging(&config, &paths);
    if cli.run_as_service {
        run_as_service(config, paths)
    } else {
        run_foreground(config, paths)
    }
}

/// Console plus `{app_data_home}/supervisor.log`; `RUST_LOG` overrides
/// the configured level.
fn init_logging(config: &GlobalConfig, paths: &Paths) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let file_layer = std::fs::create_dir_all(&paths.app_data_home)
        .and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(paths.supervisor_log_file())
        })
        .ok()
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
        });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();
}

/// Assemble the control plane; must run inside a tokio runtime.
fn build_control(config: &GlobalConfig, paths: &Paths) -> Result<ControlPlane, Error> {
    let specs = config.service_specs(paths)?;
    paths.ensure_service_dirs(specs.iter().map(|s| s.name.as_str()))?;
    let scheduler = Arc::new(Scheduler::new(
        specs,
        SupervisorOptions::default(),
        StatusBoard::new(),
        EventBus::default(),
        CancellationToken::new(),
    )?);
    Ok(ControlPlane::new(scheduler, paths.clone()))
}

fn run_foreground(config: GlobalConfig, paths: Paths) -> i32 {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return exit_code::GENERIC;
        }
    };
    rt.block_on(async {
        if let Err(e) = control::acquire_pid_file(&paths) {
            error!("{}", e);
            return e.exit_code();
        }
        let control = match build_control(&config, &paths) {
            Ok(control) => control,
            Err(e) => {
                error!("{}", e);
                control::release_pid_file(&paths);
                return e.exit_code();
            }
        };
        let _status_writer = control.spawn_status_writer();
        let _event_printer = spawn_event_printer(&control);

        info!("process-compose starting");
        if let Err(e) = control.start_all().await {
            error!(error = %e, "startup did not complete");
        }

        wait_for_shutdown_signal().await;
        info!("termination requested, stopping all services");
        if let Err(e) = control.stop_all(STOP_GRACE).await {
            error!(error = %e, "shutdown did not complete cleanly");
        }
        control::release_pid_file(&paths);
        exit_code::OK
    })
}

/// Stream transition events to stdout for the foreground session.
fn spawn_event_printer(control: &ControlPlane) -> tokio::task::JoinHandle<()> {
    let mut rx = control.scheduler().events().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => println!("{} {}", ev.ts.format("%Y-%m-%d %H:%M:%S"), ev),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn run_as_service(config: GlobalConfig, paths: Paths) -> i32 {
    let settings = ServiceSettings {
        name: config.sys_service_name.clone(),
        description: config.sys_service_desc.clone(),
    };
    let program = match Program::build(config, paths) {
        Ok(program) => program,
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };
    match sys_service::run(&settings, Box::new(program)) {
        Ok(()) => exit_code::OK,
        Err(e) => {
            error!(error = %e, "service mode failed");
            exit_code::GENERIC
        }
    }
}

fn cmd_service_control(action: ServiceAction, config: &GlobalConfig) -> i32 {
    let settings = ServiceSettings {
        name: config.sys_service_name.clone(),
        description: config.sys_service_desc.clone(),
    };
    match sys_service::control(action, &settings) {
        Ok(()) => {
            println!("{:?} succeeded", action);
            exit_code::OK
        }
        Err(e) => {
            eprintln!("{:?} failed: {:#}", action, e);
            exit_code::GENERIC
        }
    }
}

fn cmd_status(paths: &Paths) -> i32 {
    match control::read_status_report(paths) {
        Ok(report) => {
            print_report(&report);
            exit_code::OK
        }
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}

fn print_report(report: &StatusReport) {
    if report.services.is_empty() {
        println!("no services configured");
        return;
    }
    println!(
        "as of {}",
        report.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for service in &report.services {
        print_service(service);
    }
}

fn print_service(snap: &ServiceSnapshot) {
    println!("* {} - {}", snap.name, snap.state);
    if let Some(pid) = snap.pid {
        println!("    pid: {}", pid);
    }
    println!("    generation: {}", snap.generation);
    if snap.consecutive_failures > 0 {
        println!("    probe failures: {}", snap.consecutive_failures);
    }
    if let Some(exit) = &snap.last_exit {
        match (exit.code, exit.signal) {
            (Some(code), _) => println!("    last exit: code {}", code),
            (None, Some(signal)) => println!("    last exit: signal {}", signal),
            (None, None) => {}
        }
    }
}

/// Supervisor driven by host start/stop callbacks. Owns its runtime so
/// callbacks arriving on service-manager threads can block on it.
struct Program {
    rt: tokio::runtime::Runtime,
    control: ControlPlane,
    paths: Paths,
}

impl Program {
    fn build(config: GlobalConfig, paths: Paths) -> Result<Self, Error> {
        let rt = tokio::runtime::Runtime::new()?;
        let control = rt.block_on(async {
            control::acquire_pid_file(&paths)?;
            let control = build_control(&config, &paths)?;
            control.spawn_status_writer();
            Ok::<_, Error>(control)
        })?;
        Ok(Self { rt, control, paths })
    }
}

impl SysServiceProgram for Program {
    fn start(&self) -> anyhow::Result<()> {
        // The host deadline is short; supervision comes up in the
        // background while the callback returns immediately.
        let control = self.control.clone();
        self.rt.spawn(async move {
            if let Err(e) = control.start_all().await {
                error!(error = %e, "startup did not complete");
            }
        });
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        let control = self.control.clone();
        self.rt
            .block_on(async move { control.stop_all(STOP_GRACE).await })?;
        control::release_pid_file(&self.paths);
        Ok(())
    }
}
