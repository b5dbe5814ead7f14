//! hlash - clash service wrapper with automatic subscription updates
//!
//! Keeps a clash engine's live config in sync with a remote subscription and
//! exposes the process as an OS service:
//! - Subscription download with bounded exponential backoff
//! - Validate-then-swap replacement of the live config with timestamped backups
//! - Periodic refresh that asks the engine to reload after every swap
//! - Service verbs (run, start, stop, restart, install, uninstall, status)
//!
//! # Architecture
//!
//! ```text
//!                  +--------------------+
//!                  | service/ (verbs)   |
//!                  +---------+----------+
//!                            | run
//!                  +---------v----------+
//!                  |   Hlash (Program)  |
//!                  +----+----------+----+
//!                       |          |
//!          +------------v--+    +--v-------------+
//!          | subscription/ |    |    engine/     |
//!          | fetch, swap,  |--->| control loop,  |
//!          | schedule      |    | reload channel |
//!          +-------+-------+    +-------+--------+
//!                  |                    |
//!          +-------v-------+    +-------v--------+
//!          |    config/    |    |   hub/ (API)   |
//!          +---------------+    +----------------+
//! ```

pub mod common;
pub mod config;
pub mod engine;
pub mod hub;
pub mod service;
pub mod subscription;

pub use common::error::{Error, Result};
pub use config::{Config, Settings};

use async_trait::async_trait;
use engine::{control_loop, reload, ClashEngine};
use service::{Program, ServiceDescriptor};
use std::sync::Arc;
use subscription::{Downloader, SubscriptionUpdater, UpdateScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Crate version reported by the CLI and the controller
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name registered with the service manager
pub const SERVICE_NAME: &str = "hlash";

/// The program run by the `run` verb
pub struct Hlash {
    settings: Arc<Settings>,
}

impl Hlash {
    pub fn new(settings: Settings) -> Self {
        Hlash {
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Service registration for these settings; `arguments` are passed to
    /// the installed executable
    pub fn descriptor(&self, arguments: Vec<String>) -> ServiceDescriptor {
        ServiceDescriptor {
            name: SERVICE_NAME.to_string(),
            display_name: SERVICE_NAME.to_string(),
            description: "Clash service with automatic subscription updates".to_string(),
            executable: None,
            arguments,
            working_directory: Some(self.settings.home_dir.clone()),
            env_vars: Default::default(),
            dependencies: vec![
                "After=network-online.target".to_string(),
                "Wants=network-online.target".to_string(),
            ],
            user_name: None,
        }
    }
}

#[async_trait]
impl Program for Hlash {
    async fn run(&self, token: CancellationToken) -> Result<()> {
        let settings = &self.settings;
        let config_path = settings.config_path();
        let (reload_handle, reload_rx) = reload::channel();

        let engine = Arc::new(ClashEngine::new(
            settings.home_dir(),
            &config_path,
            reload_handle.clone(),
        ));
        let updater = Arc::new(SubscriptionUpdater::new(
            settings.subscribe_url.clone(),
            &config_path,
            Downloader::new()?,
            engine.clone(),
        ));

        if !settings.run_engine {
            info!("updater only, refreshing every {:?}", settings.subscribe_interval);
            UpdateScheduler::new(updater, settings.subscribe_interval, None)
                .run(token)
                .await;
            return Ok(());
        }

        let scheduler = UpdateScheduler::new(
            updater,
            settings.subscribe_interval,
            Some(reload_handle.clone()),
        );
        // the engine reads whatever this leaves in place
        scheduler.update_now(&token).await;

        let hangup = reload::forward_hangup(reload_handle, token.clone())?;
        let periodic = tokio::spawn(scheduler.run_periodic(token.clone()));

        let result = control_loop(
            engine.as_ref(),
            settings.home_dir(),
            &config_path,
            &settings.engine_options(),
            reload_rx,
            token.clone(),
        )
        .await;

        token.cancel();
        if let Err(e) = periodic.await {
            warn!("subscription task: {}", e);
        }
        if let Err(e) = hangup.await {
            warn!("hangup task: {}", e);
        }
        result
    }
}
