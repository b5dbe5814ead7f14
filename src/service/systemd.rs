//! systemd service driver
//!
//! Installs a unit file under `/etc/systemd/system` and drives it through
//! `systemctl`. Every `systemctl` call is bounded by a timeout and the child is
//! killed when it expires.

use super::{ServiceDescriptor, ServiceDriver, ServiceStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Directory systemd reads system units from
pub const UNIT_DIR: &str = "/etc/systemd/system";

/// Upper bound for a single `systemctl` call
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SystemdDriver {
    descriptor: ServiceDescriptor,
    unit_dir: PathBuf,
}

impl SystemdDriver {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self::with_unit_dir(descriptor, UNIT_DIR)
    }

    pub fn with_unit_dir(descriptor: ServiceDescriptor, unit_dir: impl Into<PathBuf>) -> Self {
        SystemdDriver {
            descriptor,
            unit_dir: unit_dir.into(),
        }
    }

    /// systemd is the running init system
    pub fn available() -> bool {
        cfg!(target_os = "linux") && Path::new("/run/systemd/system").is_dir()
    }

    pub fn unit_name(&self) -> String {
        format!("{}.service", self.descriptor.name)
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(self.unit_name())
    }

    async fn unit_exists(&self) -> bool {
        tokio::fs::try_exists(self.unit_path()).await.unwrap_or(false)
    }

    async fn systemctl(&self, args: &[&str]) -> Result<Output> {
        debug!("systemctl {}", args.join(" "));
        let child = Command::new("systemctl")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        tokio::time::timeout(SYSTEMCTL_TIMEOUT, child)
            .await
            .map_err(|_| Error::driver(format!("systemctl {} timed out", args.join(" "))))?
            .map_err(|e| Error::driver(format!("failed to run systemctl: {}", e)))
    }

    async fn systemctl_ok(&self, args: &[&str]) -> Result<()> {
        let output = self.systemctl(args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::driver(format!(
            "systemctl {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }

    fn executable(&self) -> Result<PathBuf> {
        match &self.descriptor.executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe()
                .map_err(|e| Error::driver(format!("cannot locate executable: {}", e))),
        }
    }
}

#[async_trait]
impl ServiceDriver for SystemdDriver {
    async fn status(&self) -> Result<ServiceStatus> {
        if !self.unit_exists().await {
            return Err(Error::NotInstalled);
        }

        // is-active exits non-zero for anything but "active"; only stdout matters
        let output = self.systemctl(&["is-active", &self.unit_name()]).await?;
        let state = String::from_utf8_lossy(&output.stdout);
        parse_active_state(state.trim())
    }

    async fn start(&self) -> Result<()> {
        self.systemctl_ok(&["start", &self.unit_name()]).await
    }

    async fn stop(&self) -> Result<()> {
        self.systemctl_ok(&["stop", &self.unit_name()]).await
    }

    async fn install(&self) -> Result<()> {
        let path = self.unit_path();
        if self.unit_exists().await {
            return Err(Error::driver(format!("Init already exists: {}", path.display())));
        }

        let unit = render_unit(&self.descriptor, &self.executable()?);
        tokio::fs::create_dir_all(&self.unit_dir)
            .await
            .map_err(|e| Error::fs("mkdir", &self.unit_dir, e))?;
        tokio::fs::write(&path, unit)
            .await
            .map_err(|e| Error::fs("write", &path, e))?;
        info!("installed {}", path.display());

        self.systemctl_ok(&["daemon-reload"]).await?;
        self.systemctl_ok(&["enable", &self.unit_name()]).await
    }

    async fn uninstall(&self) -> Result<()> {
        self.systemctl_ok(&["disable", &self.unit_name()]).await?;

        let path = self.unit_path();
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| Error::fs("remove", &path, e))?;
        info!("removed {}", path.display());

        self.systemctl_ok(&["daemon-reload"]).await
    }

    async fn request_stop(&self) -> Result<()> {
        // the unit cannot finish stopping while this process waits for it
        self.systemctl_ok(&["stop", "--no-block", &self.unit_name()]).await
    }

    fn interactive(&self) -> bool {
        if std::env::var_os("INVOCATION_ID").is_some() {
            return false;
        }
        #[cfg(unix)]
        {
            nix::unistd::getppid().as_raw() != 1
        }
        #[cfg(not(unix))]
        {
            true
        }
    }
}

fn parse_active_state(state: &str) -> Result<ServiceStatus> {
    match state {
        "active" | "activating" | "reloading" => Ok(ServiceStatus::Running),
        "inactive" | "failed" | "deactivating" => Ok(ServiceStatus::Stopped),
        other => Err(Error::driver(format!("unknown service state: {}", other))),
    }
}

/// Quote one ExecStart argument the way systemd parses it
fn quote_arg(arg: &str) -> String {
    let escaped = arg.replace('%', "%%");
    let needs_quotes = escaped.is_empty()
        || escaped
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';' | '$'));
    if !needs_quotes {
        return escaped;
    }
    let inner = escaped
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "$$");
    format!("\"{}\"", inner)
}

/// Render the unit file for `descriptor`
pub fn render_unit(descriptor: &ServiceDescriptor, executable: &Path) -> String {
    let mut unit = String::new();
    let exe = executable.display().to_string();

    let _ = writeln!(unit, "[Unit]");
    let _ = writeln!(unit, "Description={}", descriptor.description);
    let _ = writeln!(unit, "ConditionFileIsExecutable={}", exe);
    for dependency in &descriptor.dependencies {
        let _ = writeln!(unit, "{}", dependency);
    }

    let _ = writeln!(unit);
    let _ = writeln!(unit, "[Service]");
    let _ = writeln!(unit, "StartLimitInterval=5");
    let _ = writeln!(unit, "StartLimitBurst=10");
    let mut exec_start = quote_arg(&exe);
    for arg in &descriptor.arguments {
        exec_start.push(' ');
        exec_start.push_str(&quote_arg(arg));
    }
    let _ = writeln!(unit, "ExecStart={}", exec_start);
    if let Some(dir) = &descriptor.working_directory {
        let _ = writeln!(unit, "WorkingDirectory={}", dir.display());
    }
    if let Some(user) = &descriptor.user_name {
        let _ = writeln!(unit, "User={}", user);
    }
    for (key, value) in &descriptor.env_vars {
        let _ = writeln!(unit, "Environment={}", quote_arg(&format!("{}={}", key, value)));
    }
    let _ = writeln!(unit, "Restart=always");
    let _ = writeln!(unit, "RestartSec=120");

    let _ = writeln!(unit);
    let _ = writeln!(unit, "[Install]");
    let _ = writeln!(unit, "WantedBy=multi-user.target");
    unit
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn descriptor() -> ServiceDescriptor {
        let mut env_vars = BTreeMap::new();
        env_vars.insert("TZ".to_string(), "Asia/Shanghai".to_string());
        ServiceDescriptor {
            name: "hlash".to_string(),
            display_name: "hlash".to_string(),
            description: "clash with subscription updates".to_string(),
            executable: Some(PathBuf::from("/usr/local/bin/hlash")),
            arguments: vec![
                "--run".to_string(),
                "-u".to_string(),
                "https://example.com/sub?token=a b".to_string(),
            ],
            working_directory: Some(PathBuf::from("/srv/hlash")),
            env_vars,
            dependencies: vec!["After=network-online.target".to_string()],
            user_name: None,
        }
    }

    #[test]
    fn test_render_unit() {
        let unit = render_unit(&descriptor(), Path::new("/usr/local/bin/hlash"));
        assert!(unit.contains("Description=clash with subscription updates\n"));
        assert!(unit.contains("After=network-online.target\n"));
        assert!(unit.contains(
            "ExecStart=/usr/local/bin/hlash --run -u \"https://example.com/sub?token=a b\"\n"
        ));
        assert!(unit.contains("WorkingDirectory=/srv/hlash\n"));
        assert!(unit.contains("Environment=TZ=Asia/Shanghai\n"));
        assert!(unit.contains("WantedBy=multi-user.target\n"));
        assert!(!unit.contains("User="));
    }

    #[test]
    fn test_quote_arg() {
        assert_eq!(quote_arg("--run"), "--run");
        assert_eq!(quote_arg(""), "\"\"");
        assert_eq!(quote_arg("50%"), "50%%");
        assert_eq!(quote_arg("a \"b\""), "\"a \\\"b\\\"\"");
        assert_eq!(quote_arg("$HOME"), "\"$$HOME\"");
    }

    #[test]
    fn test_parse_active_state() {
        assert_eq!(parse_active_state("active").unwrap(), ServiceStatus::Running);
        assert_eq!(parse_active_state("inactive").unwrap(), ServiceStatus::Stopped);
        assert_eq!(parse_active_state("failed").unwrap(), ServiceStatus::Stopped);
        assert!(matches!(parse_active_state("maintenance"), Err(Error::Driver(_))));
    }

    #[tokio::test]
    async fn test_missing_unit_is_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SystemdDriver::with_unit_dir(descriptor(), dir.path());
        assert_eq!(driver.unit_path(), dir.path().join("hlash.service"));
        assert!(matches!(driver.status().await, Err(Error::NotInstalled)));
    }
}
