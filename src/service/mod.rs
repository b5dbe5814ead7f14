//! OS service control
//!
//! [`ServiceController`] turns a control verb into the minimal set of driver
//! calls for the state the service manager reports, then re-queries the
//! manager so the message describes what actually happened.
//!
//! ```text
//!            +-------- start ---------+
//!            v                        |
//!  NotInstalled --install--> Stopped <-+-- stop -- Running
//!            ^                  |                    ^
//!            +---- uninstall ---+------- start ------+
//! ```

pub mod lifecycle;
pub mod systemd;
pub mod unsupported;

pub use lifecycle::{run_program, shutdown_signal};
pub use systemd::SystemdDriver;
pub use unsupported::UnsupportedDriver;

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const MSG_STARTED: &str = "started";
pub const MSG_STOPPED: &str = "stopped";
pub const MSG_UNINSTALLED: &str = "uninstalled";
pub const MSG_NOT_INSTALLED: &str = "service not installed";
pub const MSG_UNSUPPORTED: &str = "unsupported system";

/// Registration data handed to the service manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service name, no spaces
    pub name: String,
    pub display_name: String,
    pub description: String,
    /// Executable to register; the current executable when `None`
    pub executable: Option<PathBuf>,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub env_vars: BTreeMap<String, String>,
    /// Raw dependency lines, e.g. `After=network-online.target` for systemd
    pub dependencies: Vec<String>,
    pub user_name: Option<String>,
}

/// State reported by a service manager for an installed service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
}

/// Capabilities of an OS service manager
///
/// `status` reports a missing service as [`Error::NotInstalled`] and a
/// platform without a usable manager as [`Error::Unsupported`].
#[async_trait]
pub trait ServiceDriver: Send + Sync {
    async fn status(&self) -> Result<ServiceStatus>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn install(&self) -> Result<()>;
    async fn uninstall(&self) -> Result<()>;

    /// Ask the manager to stop this service without waiting for it, used by
    /// the service itself when its work has ended
    async fn request_stop(&self) -> Result<()> {
        self.stop().await
    }

    /// False when the process was launched by the service manager
    fn interactive(&self) -> bool {
        true
    }
}

/// Lifecycle hooks of the program the service runs
#[async_trait]
pub trait Program: Send + Sync + 'static {
    /// Runs to completion before [`Program::run`] is started
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Main work; must return promptly once `token` is cancelled
    async fn run(&self, token: CancellationToken) -> Result<()>;
}

/// Control verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Run,
    Start,
    Stop,
    Restart,
    Install,
    Uninstall,
    Status,
}

impl ServiceAction {
    pub const ALL: [ServiceAction; 7] = [
        ServiceAction::Run,
        ServiceAction::Start,
        ServiceAction::Stop,
        ServiceAction::Restart,
        ServiceAction::Install,
        ServiceAction::Uninstall,
        ServiceAction::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Run => "run",
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Install => "install",
            ServiceAction::Uninstall => "uninstall",
            ServiceAction::Status => "status",
        }
    }

    pub fn usage(&self) -> &'static str {
        match self {
            ServiceAction::Run => "run in the foreground",
            ServiceAction::Start => "start the service",
            ServiceAction::Stop => "stop the service",
            ServiceAction::Restart => "restart the service",
            ServiceAction::Install => "install and start the service",
            ServiceAction::Uninstall => "stop and remove the service",
            ServiceAction::Status => "show service status",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ServiceAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::UnknownAction(s.to_string()))
    }
}

/// Service state as observed, driver errors folded in
#[derive(Debug)]
pub enum ServiceState {
    Running,
    Stopped,
    NotInstalled,
    Unsupported,
    Failed(Error),
}

impl From<Result<ServiceStatus>> for ServiceState {
    fn from(result: Result<ServiceStatus>) -> Self {
        match result {
            Ok(ServiceStatus::Running) => ServiceState::Running,
            Ok(ServiceStatus::Stopped) => ServiceState::Stopped,
            Err(Error::NotInstalled) => ServiceState::NotInstalled,
            Err(Error::Unsupported) => ServiceState::Unsupported,
            Err(e) => ServiceState::Failed(e),
        }
    }
}

/// User-facing message for driver errors that are not failures
fn informational(e: &Error) -> Option<&'static str> {
    if !e.is_informational() {
        return None;
    }
    match e {
        Error::NotInstalled => Some(MSG_NOT_INSTALLED),
        _ => Some(MSG_UNSUPPORTED),
    }
}

/// Maps control verbs onto a [`ServiceDriver`]
pub struct ServiceController {
    descriptor: ServiceDescriptor,
    driver: Arc<dyn ServiceDriver>,
}

impl ServiceController {
    pub fn new(descriptor: ServiceDescriptor, driver: Arc<dyn ServiceDriver>) -> Self {
        ServiceController { descriptor, driver }
    }

    /// Pick the service manager of the running system
    pub fn detect(descriptor: ServiceDescriptor) -> Self {
        let driver = detect_driver(&descriptor);
        Self::new(descriptor, driver)
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Execute `action`; `run` blocks until the program ends
    pub async fn execute<P: Program>(&self, action: ServiceAction, program: Arc<P>) -> Result<String> {
        if action == ServiceAction::Run {
            run_program(program, &self.descriptor, self.driver.clone(), shutdown_signal()).await?;
            return Ok(String::new());
        }
        self.control(action).await
    }

    async fn observe(&self) -> ServiceState {
        let state = ServiceState::from(self.driver.status().await);
        debug!("service {} state: {:?}", self.descriptor.name, state);
        state
    }

    /// Drive the service manager through `action` and report the observed
    /// state afterwards. `run` is not a state transition and is rejected here.
    pub async fn control(&self, action: ServiceAction) -> Result<String> {
        let pre = match self.observe().await {
            ServiceState::Failed(e) => return Err(e),
            ServiceState::Unsupported => return Ok(MSG_UNSUPPORTED.to_string()),
            state => state,
        };

        let acted = match action {
            ServiceAction::Run => return Err(Error::UnknownAction(action.to_string())),
            ServiceAction::Status => {
                let message = match pre {
                    ServiceState::Running => MSG_STARTED,
                    ServiceState::Stopped => MSG_STOPPED,
                    _ => MSG_NOT_INSTALLED,
                };
                return Ok(message.to_string());
            }
            ServiceAction::Start => match pre {
                ServiceState::Stopped => self.driver.start().await,
                _ => Ok(()),
            },
            ServiceAction::Stop => match pre {
                ServiceState::Running => self.driver.stop().await,
                _ => Ok(()),
            },
            ServiceAction::Restart => self.restart(&pre).await,
            ServiceAction::Install => self.install(&pre).await,
            ServiceAction::Uninstall => match pre {
                ServiceState::NotInstalled => return Ok(MSG_NOT_INSTALLED.to_string()),
                ServiceState::Running => match self.driver.stop().await {
                    Ok(()) => self.driver.uninstall().await,
                    Err(e) => Err(e),
                },
                _ => self.driver.uninstall().await,
            },
        };

        if let Err(e) = acted {
            return match informational(&e) {
                Some(message) => Ok(message.to_string()),
                None => Err(e),
            };
        }

        let post = self.observe().await;
        let message = if action == ServiceAction::Uninstall {
            match post {
                ServiceState::NotInstalled => MSG_UNINSTALLED,
                ServiceState::Unsupported => MSG_UNSUPPORTED,
                ServiceState::Failed(e) => return Err(e),
                ServiceState::Running | ServiceState::Stopped => {
                    return Err(Error::driver("service is still installed after uninstall"))
                }
            }
        } else {
            match post {
                ServiceState::Running => MSG_STARTED,
                ServiceState::Stopped => MSG_STOPPED,
                ServiceState::NotInstalled => MSG_NOT_INSTALLED,
                ServiceState::Unsupported => MSG_UNSUPPORTED,
                ServiceState::Failed(e) => return Err(e),
            }
        };
        Ok(message.to_string())
    }

    async fn restart(&self, pre: &ServiceState) -> Result<()> {
        if matches!(pre, ServiceState::Running) {
            self.driver.stop().await?;
        }
        self.driver.start().await
    }

    async fn install(&self, pre: &ServiceState) -> Result<()> {
        let installed_now = matches!(pre, ServiceState::NotInstalled);
        if installed_now {
            self.driver.install().await?;
        }

        let stopped = if installed_now {
            matches!(self.observe().await, ServiceState::Stopped)
        } else {
            matches!(pre, ServiceState::Stopped)
        };
        if stopped {
            self.driver.start().await?;
        }
        Ok(())
    }
}

/// Service manager for the running system
pub fn detect_driver(descriptor: &ServiceDescriptor) -> Arc<dyn ServiceDriver> {
    if SystemdDriver::available() {
        Arc::new(SystemdDriver::new(descriptor.clone()))
    } else {
        Arc::new(UnsupportedDriver)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted in-memory service manager recording every mutating call
    pub(crate) struct MockDriver {
        state: Mutex<Result<ServiceStatus>>,
        calls: Mutex<Vec<&'static str>>,
        pub(crate) fail_start: bool,
        pub(crate) start_has_no_effect: bool,
        pub(crate) interactive: bool,
    }

    fn copy(state: &Result<ServiceStatus>) -> Result<ServiceStatus> {
        match state {
            Ok(s) => Ok(*s),
            Err(Error::NotInstalled) => Err(Error::NotInstalled),
            Err(Error::Unsupported) => Err(Error::Unsupported),
            Err(e) => Err(Error::driver(e.to_string())),
        }
    }

    impl MockDriver {
        pub(crate) fn new(state: Result<ServiceStatus>) -> Self {
            MockDriver {
                state: Mutex::new(state),
                calls: Mutex::new(Vec::new()),
                fail_start: false,
                start_has_no_effect: false,
                interactive: true,
            }
        }

        pub(crate) fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn set(&self, state: Result<ServiceStatus>) {
            *self.state.lock().unwrap() = state;
        }

        fn installed(&self) -> Result<()> {
            copy(&self.state.lock().unwrap()).map(|_| ())
        }
    }

    #[async_trait]
    impl ServiceDriver for MockDriver {
        async fn status(&self) -> Result<ServiceStatus> {
            copy(&self.state.lock().unwrap())
        }

        async fn start(&self) -> Result<()> {
            self.record("start");
            self.installed()?;
            if self.fail_start {
                return Err(Error::driver("start failed"));
            }
            if !self.start_has_no_effect {
                self.set(Ok(ServiceStatus::Running));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.record("stop");
            self.installed()?;
            self.set(Ok(ServiceStatus::Stopped));
            Ok(())
        }

        async fn install(&self) -> Result<()> {
            self.record("install");
            self.set(Ok(ServiceStatus::Stopped));
            Ok(())
        }

        async fn uninstall(&self) -> Result<()> {
            self.record("uninstall");
            self.installed()?;
            self.set(Err(Error::NotInstalled));
            Ok(())
        }

        async fn request_stop(&self) -> Result<()> {
            self.record("request_stop");
            Ok(())
        }

        fn interactive(&self) -> bool {
            self.interactive
        }
    }
}
