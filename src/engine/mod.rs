//! Engine boundary
//!
//! The proxy engine is consumed through [`Engine`]: initialise the home
//! directory, parse and apply the live config, re-parse a file, and apply a
//! parsed config in place. [`ClashEngine`] owns the applied config and the
//! external controller; [`control_loop`] keeps it in sync with reload
//! requests.

pub mod reload;

pub use reload::{ReloadHandle, ReloadReceiver};

use crate::config::{Config, DEFAULT_CONFIG};
use crate::hub::{AppState, Controller};
use crate::subscription::ConfigValidator;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long a replaced controller gets to release its listener
const CONTROLLER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line overrides layered on top of every parsed config
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOptions {
    pub secret: Option<String>,
    pub external_controller: Option<String>,
    pub external_ui: Option<String>,
    pub mixed_port: Option<u16>,
}

impl EngineOptions {
    pub fn apply(&self, config: &mut Config) {
        if let Some(secret) = self.secret.as_ref().filter(|s| !s.is_empty()) {
            config.secret = Some(secret.clone());
        }
        if let Some(addr) = self.external_controller.as_ref().filter(|s| !s.is_empty()) {
            config.external_controller = Some(addr.clone());
        }
        if let Some(ui) = self.external_ui.as_ref().filter(|s| !s.is_empty()) {
            config.external_ui = Some(ui.clone());
        }
        if let Some(port) = self.mixed_port.filter(|p| *p > 0) {
            config.mixed_port = port;
            config.port = 0;
            config.socks_port = 0;
        }
    }
}

/// Operations the wrapper needs from a proxy engine
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create the home directory and seed a default config when none exists
    async fn init_config_dir(&self, home: &Path) -> Result<()>;

    /// Parse the live config with `options` applied and make it current
    async fn parse_and_apply(&self, options: &EngineOptions) -> Result<()>;

    /// Parse and validate the document at `path`
    async fn reparse_from_path(&self, path: &Path) -> Result<Config>;

    /// Replace the running config
    async fn apply_config(&self, config: Config, force: bool) -> Result<()>;

    /// Release listeners
    async fn shutdown(&self) {}
}

struct RunningController {
    addr: String,
    secret: String,
    controller: Controller,
}

/// Default engine: holds the applied clash config and serves the controller
pub struct ClashEngine {
    home: PathBuf,
    config_path: PathBuf,
    options: RwLock<EngineOptions>,
    config: Arc<RwLock<Config>>,
    reload: ReloadHandle,
    controller: Mutex<Option<RunningController>>,
    token: CancellationToken,
}

impl ClashEngine {
    pub fn new(home: impl Into<PathBuf>, config_path: impl Into<PathBuf>, reload: ReloadHandle) -> Self {
        ClashEngine {
            home: home.into(),
            config_path: config_path.into(),
            options: RwLock::new(EngineOptions::default()),
            config: Arc::new(RwLock::new(Config::default())),
            reload,
            controller: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Snapshot of the applied config
    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Local address of the running controller, if any
    pub async fn controller_addr(&self) -> Option<std::net::SocketAddr> {
        self.controller
            .lock()
            .await
            .as_ref()
            .map(|c| c.controller.local_addr())
    }

    async fn restart_controller(&self, config: &Config) -> Result<()> {
        let addr = config.external_controller.clone().unwrap_or_default();
        let secret = config.secret.clone().unwrap_or_default();

        let mut slot = self.controller.lock().await;
        let unchanged = match slot.as_ref() {
            Some(running) => running.addr == addr && running.secret == secret,
            None => addr.is_empty(),
        };
        if unchanged {
            return Ok(());
        }

        if let Some(old) = slot.take() {
            old.controller.shutdown(CONTROLLER_SHUTDOWN_TIMEOUT).await;
        }
        if addr.is_empty() {
            return Ok(());
        }

        let ui_dir = config.external_ui.as_ref().map(|ui| self.home.join(ui));
        let state = AppState::new(secret.clone(), self.config.clone(), self.reload.clone());
        let controller = Controller::spawn(&addr, state, ui_dir, self.token.child_token()).await?;
        *slot = Some(RunningController {
            addr,
            secret,
            controller,
        });
        Ok(())
    }
}

#[async_trait]
impl Engine for ClashEngine {
    async fn init_config_dir(&self, home: &Path) -> Result<()> {
        tokio::fs::create_dir_all(home)
            .await
            .map_err(|e| Error::fs("mkdir", home, e))?;

        if !tokio::fs::try_exists(&self.config_path).await.unwrap_or(false) {
            info!("Can't find config, create an initial config file");
            tokio::fs::write(&self.config_path, DEFAULT_CONFIG)
                .await
                .map_err(|e| Error::fs("write", &self.config_path, e))?;
        }
        Ok(())
    }

    async fn parse_and_apply(&self, options: &EngineOptions) -> Result<()> {
        *self.options.write().await = options.clone();
        let config = self.reparse_from_path(&self.config_path).await?;
        self.apply_config(config, true).await
    }

    async fn reparse_from_path(&self, path: &Path) -> Result<Config> {
        let mut config = Config::load_async(path).await?;
        self.options.read().await.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    async fn apply_config(&self, config: Config, force: bool) -> Result<()> {
        let changed = *self.config.read().await != config;
        if !changed && !force {
            return Ok(());
        }

        self.restart_controller(&config).await?;
        info!(
            "config applied: mixed-port={} port={} socks-port={} mode={} proxies={} rules={}",
            config.mixed_port,
            config.port,
            config.socks_port,
            config.mode,
            config.proxies.len(),
            config.rules.len()
        );
        *self.config.write().await = config;
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(running) = self.controller.lock().await.take() {
            running.controller.shutdown(CONTROLLER_SHUTDOWN_TIMEOUT).await;
        }
        self.token.cancel();
    }
}

#[async_trait]
impl ConfigValidator for ClashEngine {
    async fn validate(&self, path: &Path) -> Result<()> {
        self.reparse_from_path(path).await.map(|_| ())
    }
}

/// Bring the engine up from the live config and apply every reload request
/// until `token` is cancelled. Failing to initialise or parse the initial
/// config is fatal; a failed reload keeps the running config.
pub async fn control_loop<E: Engine + ?Sized>(
    engine: &E,
    home: &Path,
    config_path: &Path,
    options: &EngineOptions,
    mut reload: ReloadReceiver,
    token: CancellationToken,
) -> Result<()> {
    engine
        .init_config_dir(home)
        .await
        .map_err(|e| Error::config(format!("Initial configuration directory error: {}", e)))?;

    engine
        .parse_and_apply(options)
        .await
        .map_err(|e| Error::config(format!("Parse config error: {}", e)))?;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            request = reload.recv() => {
                if request.is_none() {
                    warn!("reload channel closed");
                    token.cancelled().await;
                    break;
                }
                match engine.reparse_from_path(config_path).await {
                    Ok(config) => {
                        if let Err(e) = engine.apply_config(config, true).await {
                            error!("Apply config error: {}", e);
                        }
                    }
                    Err(e) => error!("Parse config error: {}", e),
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
