//! Windows service host for the backend. Installation registers an
//! auto-start service launched with the `service` argument; dispatch
//! detection falls back to interactive mode outside a service context.

#[cfg(windows)]
pub const SERVICE_NAME: &str = "MRVPN";

pub const EXIT_FAILURE: exitcode::ExitCode = 1;

#[cfg(windows)]
pub use windows_impl::{install, run_service, service_manager_start, service_manager_stop, try_dispatch, uninstall};

#[cfg(not(windows))]
pub use fallback_impl::{install, run_service, service_manager_start, service_manager_stop, try_dispatch, uninstall};

#[cfg(windows)]
mod windows_impl {
    use super::{EXIT_FAILURE, SERVICE_NAME};

    use anyhow::{Context, Result};
    use tokio_util::sync::CancellationToken;
    use winreg::RegKey;
    use winreg::enums::HKEY_LOCAL_MACHINE;

    use std::ffi::OsString;
    use std::sync::OnceLock;
    use std::time::Duration;

    use windows_service::service::{
        ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl, ServiceExitCode,
        ServiceInfo, ServiceStartType, ServiceState, ServiceStatus, ServiceType,
    };
    use windows_service::service_control_handler::{self, ServiceControlHandlerResult, ServiceStatusHandle};
    use windows_service::service_dispatcher;
    use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

    use mrvpn_lib::{ipc, logging};

    const EVENTLOG_KEY: &str = r"SYSTEM\CurrentControlSet\Services\EventLog\Application\MRVPN";
    // info, warning and error event types
    const EVENTLOG_TYPES: u32 = 7;
    const STOP_WAIT: Duration = Duration::from_secs(2);
    const ERROR_FAILED_SERVICE_CONTROLLER_CONNECT: i32 = 1063;

    static ENDPOINT: OnceLock<String> = OnceLock::new();

    pub fn install() -> exitcode::ExitCode {
        match create_service() {
            Ok(()) => {
                println!("service {SERVICE_NAME} installed");
                exitcode::OK
            }
            Err(e) => {
                eprintln!("failed installing service: {e:#}");
                EXIT_FAILURE
            }
        }
    }

    pub fn uninstall() -> exitcode::ExitCode {
        match delete_service() {
            Ok(()) => {
                println!("service {SERVICE_NAME} removed");
                exitcode::OK
            }
            Err(e) => {
                eprintln!("failed removing service: {e:#}");
                EXIT_FAILURE
            }
        }
    }

    pub fn service_manager_start() -> exitcode::ExitCode {
        let result = open_service(ServiceAccess::START).and_then(|service| {
            service.start(&[] as &[&std::ffi::OsStr]).context("starting service")
        });
        match result {
            Ok(()) => exitcode::OK,
            Err(e) => {
                eprintln!("failed starting service: {e:#}");
                EXIT_FAILURE
            }
        }
    }

    pub fn service_manager_stop() -> exitcode::ExitCode {
        let result = open_service(ServiceAccess::STOP).and_then(|service| {
            service.stop().map(|_| ()).context("stopping service")
        });
        match result {
            Ok(()) => exitcode::OK,
            Err(e) => {
                eprintln!("failed stopping service: {e:#}");
                EXIT_FAILURE
            }
        }
    }

    /// Explicit `service` subcommand from the service control manager.
    pub fn run_service(endpoint: String) -> exitcode::ExitCode {
        let _ = ENDPOINT.set(endpoint);
        match service_dispatcher::start(SERVICE_NAME, ffi_service_main) {
            Ok(()) => exitcode::OK,
            Err(e) => {
                eprintln!("service dispatch failed: {e}");
                exitcode::SOFTWARE
            }
        }
    }

    /// Runs service dispatch when launched by the service manager. Returns
    /// `None` in an interactive context so the caller can fall back.
    pub fn try_dispatch(endpoint: &str) -> Option<exitcode::ExitCode> {
        let _ = ENDPOINT.set(endpoint.to_string());
        match service_dispatcher::start(SERVICE_NAME, ffi_service_main) {
            Ok(()) => Some(exitcode::OK),
            Err(windows_service::Error::Winapi(e))
                if e.raw_os_error() == Some(ERROR_FAILED_SERVICE_CONTROLLER_CONNECT) =>
            {
                None
            }
            Err(e) => {
                eprintln!("service dispatch failed: {e}");
                Some(exitcode::SOFTWARE)
            }
        }
    }

    windows_service::define_windows_service!(ffi_service_main, service_main);

    fn service_main(_arguments: Vec<OsString>) {
        if let Err(e) = run_service_main() {
            tracing::error!(error = %e, "service run failed");
        }
    }

    fn run_service_main() -> Result<()> {
        let log_path = logging::init_service();
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log = %log_path.display(),
            "starting {} service",
            env!("CARGO_PKG_NAME")
        );

        let shutdown = CancellationToken::new();
        let stop_signal = shutdown.clone();
        let event_handler = move |control| match control {
            ServiceControl::Stop | ServiceControl::Shutdown => {
                tracing::info!("stop requested by service manager");
                stop_signal.cancel();
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            _ => ServiceControlHandlerResult::NotImplemented,
        };
        let status = service_control_handler::register(SERVICE_NAME, event_handler)
            .context("registering service control handler")?;

        set_status(&status, ServiceState::StartPending, ServiceControlAccept::empty())?;
        let runtime = tokio::runtime::Runtime::new().context("creating runtime")?;
        set_status(
            &status,
            ServiceState::Running,
            ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN,
        )?;

        let endpoint = ENDPOINT
            .get()
            .cloned()
            .unwrap_or_else(|| ipc::DEFAULT_ENDPOINT.to_string());
        let result = runtime.block_on(crate::run::run(&endpoint, shutdown));

        set_status(&status, ServiceState::StopPending, ServiceControlAccept::empty())?;
        if let Err(e) = &result {
            tracing::error!(error = %e, "core run failed");
        }
        let exit_code = if result.is_ok() { 0 } else { 1 };
        status
            .set_service_status(ServiceStatus {
                service_type: ServiceType::OWN_PROCESS,
                current_state: ServiceState::Stopped,
                controls_accepted: ServiceControlAccept::empty(),
                exit_code: ServiceExitCode::Win32(exit_code),
                checkpoint: 0,
                wait_hint: Duration::default(),
                process_id: None,
            })
            .context("reporting stopped state")?;
        result
    }

    fn set_status(
        handle: &ServiceStatusHandle,
        state: ServiceState,
        accepted: ServiceControlAccept,
    ) -> Result<()> {
        handle
            .set_service_status(ServiceStatus {
                service_type: ServiceType::OWN_PROCESS,
                current_state: state,
                controls_accepted: accepted,
                exit_code: ServiceExitCode::Win32(0),
                checkpoint: 0,
                wait_hint: Duration::default(),
                process_id: None,
            })
            .context("reporting service status")
    }

    fn create_service() -> Result<()> {
        let executable = std::env::current_exe()
            .and_then(|exe| exe.canonicalize())
            .context("resolving service executable path")?;

        let manager = ServiceManager::local_computer(
            None::<&str>,
            ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE,
        )
        .context("connecting to service manager")?;

        let info = ServiceInfo {
            name: OsString::from(SERVICE_NAME),
            display_name: OsString::from("MRVPN Backend Service"),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: executable.clone(),
            launch_arguments: vec![OsString::from("service")],
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };
        manager
            .create_service(&info, ServiceAccess::QUERY_STATUS)
            .context("creating service")?;

        register_event_log_source(&executable.display().to_string()).context("registering event log source")?;
        Ok(())
    }

    fn delete_service() -> Result<()> {
        let service = open_service(ServiceAccess::QUERY_STATUS | ServiceAccess::STOP | ServiceAccess::DELETE)?;
        let status = service.query_status().context("querying service status")?;
        if status.current_state != ServiceState::Stopped {
            if let Err(e) = service.stop() {
                tracing::warn!(error = %e, "stop before delete failed");
            }
            std::thread::sleep(STOP_WAIT);
        }
        service.delete().context("deleting service")?;
        remove_event_log_source();
        Ok(())
    }

    fn open_service(access: ServiceAccess) -> Result<windows_service::service::Service> {
        let manager = ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)
            .context("connecting to service manager")?;
        manager.open_service(SERVICE_NAME, access).context("opening service")
    }

    fn register_event_log_source(executable: &str) -> std::io::Result<()> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        let (key, _) = hklm.create_subkey(EVENTLOG_KEY)?;
        key.set_value("EventMessageFile", &executable)?;
        key.set_value("TypesSupported", &EVENTLOG_TYPES)?;
        Ok(())
    }

    fn remove_event_log_source() {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        if let Err(e) = hklm.delete_subkey_all(EVENTLOG_KEY) {
            tracing::warn!(error = %e, "failed removing event log source");
        }
    }
}

#[cfg(not(windows))]
mod fallback_impl {
    use super::EXIT_FAILURE;

    pub fn install() -> exitcode::ExitCode {
        eprintln!("service registration requires windows");
        EXIT_FAILURE
    }

    pub fn uninstall() -> exitcode::ExitCode {
        eprintln!("service registration requires windows");
        EXIT_FAILURE
    }

    pub fn service_manager_start() -> exitcode::ExitCode {
        eprintln!("service control requires windows");
        EXIT_FAILURE
    }

    pub fn service_manager_stop() -> exitcode::ExitCode {
        eprintln!("service control requires windows");
        EXIT_FAILURE
    }

    pub fn run_service(_endpoint: String) -> exitcode::ExitCode {
        eprintln!("service dispatch requires windows");
        EXIT_FAILURE
    }

    pub fn try_dispatch(_endpoint: &str) -> Option<exitcode::ExitCode> {
        None
    }
}
