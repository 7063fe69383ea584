//! Windows SCM adapter.
//!
//! The dispatcher owns the process main thread; the program reference is
//! handed over through a process-wide slot because the SCM entry point
//! cannot carry state. Start must be acknowledged inside the SCM
//! deadline, so the program's `start` only kicks off supervision.

use std::ffi::OsString;
use std::sync::mpsc;
use std::sync::OnceLock;
use std::time::Duration;

use tracing::{error, info};
use windows_service::{
    define_windows_service,
    service::{
        ServiceAccess, ServiceAction, ServiceActionType, ServiceControl, ServiceControlAccept,
        ServiceErrorControl, ServiceExitCode, ServiceFailureActions, ServiceFailureResetPeriod,
        ServiceInfo, ServiceStartType, ServiceState, ServiceStatus, ServiceType,
    },
    service_control_handler::{self, ServiceControlHandlerResult},
    service_dispatcher,
    service_manager::{ServiceManager, ServiceManagerAccess},
};

use super::{ServiceSettings, SysServiceProgram, RUN_AS_SERVICE_ARG};

const SERVICE_TYPE: ServiceType = ServiceType::OWN_PROCESS;

struct ServiceContext {
    name: String,
    program: Box<dyn SysServiceProgram>,
}

static CONTEXT: OnceLock<ServiceContext> = OnceLock::new();

define_windows_service!(ffi_service_main, service_main);

pub fn run(settings: &ServiceSettings, program: Box<dyn SysServiceProgram>) -> anyhow::Result<()> {
    let context = ServiceContext {
        name: settings.name.clone(),
        program,
    };
    CONTEXT
        .set(context)
        .map_err(|_| anyhow::anyhow!("service context already initialized"))?;
    info!(service = %settings.name, "starting SCM dispatcher");
    service_dispatcher::start(settings.name.clone(), ffi_service_main)?;
    Ok(())
}

pub fn install(settings: &ServiceSettings) -> anyhow::Result<()> {
    let manager_access = ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE;
    let service_manager = ServiceManager::local_computer(None::<&str>, manager_access)?;
    let service_info = ServiceInfo {
        name: OsString::from(settings.name.clone()),
        display_name: OsString::from(settings.name.clone()),
        service_type: SERVICE_TYPE,
        start_type: ServiceStartType::AutoStart,
        error_control: ServiceErrorControl::Normal,
        executable_path: std::env::current_exe()?,
        launch_arguments: vec![format!("--{}", RUN_AS_SERVICE_ARG).into()],
        dependencies: vec![],
        account_name: None, // run as System
        account_password: None,
    };
    let service = service_manager
        .create_service(&service_info, ServiceAccess::START | ServiceAccess::CHANGE_CONFIG)?;
    service.set_description(settings.description.clone())?;
    // Let the SCM restart the supervisor itself after a crash.
    let actions = vec![
        ServiceAction {
            action_type: ServiceActionType::Restart,
            delay: Duration::from_secs(5),
        },
        ServiceAction {
            action_type: ServiceActionType::Restart,
            delay: Duration::from_secs(10),
        },
        ServiceAction {
            action_type: ServiceActionType::None,
            delay: Duration::default(),
        },
    ];
    service.update_failure_actions(ServiceFailureActions {
        reset_period: ServiceFailureResetPeriod::After(Duration::from_secs(86400)),
        reboot_msg: None,
        command: None,
        actions: Some(actions),
    })?;
    Ok(())
}

fn service_main(_arguments: Vec<OsString>) {
    if let Err(e) = run_service() {
        error!(error = %e, "service main failed");
    }
}

fn run_service() -> anyhow::Result<()> {
    let context = CONTEXT
        .get()
        .ok_or_else(|| anyhow::anyhow!("service context not initialized"))?;

    // Acknowledge the SCM before supervision finishes coming up.
    context.program.start()?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let event_handler = move |control_event| -> ServiceControlHandlerResult {
        match control_event {
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            ServiceControl::Stop => {
                let _ = shutdown_tx.send(());
                ServiceControlHandlerResult::NoError
            }
            _ => ServiceControlHandlerResult::NotImplemented,
        }
    };
    let status_handle = service_control_handler::register(context.name.clone(), event_handler)?;
    status_handle.set_service_status(running_status(ServiceState::Running))?;

    loop {
        match shutdown_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(_) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => (),
        }
    }

    info!("stop received from the service control manager");
    status_handle.set_service_status(running_status(ServiceState::StopPending))?;
    if let Err(e) = context.program.stop() {
        error!(error = %e, "error while stopping services");
    }
    status_handle.set_service_status(running_status(ServiceState::Stopped))?;
    Ok(())
}

fn running_status(state: ServiceState) -> ServiceStatus {
    ServiceStatus {
        service_type: SERVICE_TYPE,
        current_state: state,
        controls_accepted: if state == ServiceState::Running {
            ServiceControlAccept::STOP
        } else {
            ServiceControlAccept::empty()
        },
        exit_code: ServiceExitCode::Win32(0),
        checkpoint: 0,
        wait_hint: Duration::default(),
        process_id: None,
    }
}
