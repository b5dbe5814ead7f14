//! Subscription updater
//!
//! Replaces the live config only with a document that passed validation,
//! keeping the previous one as a timestamped backup. The engine reads the live
//! path, which always holds a complete file because the swap is a rename.

use super::{ConfigValidator, Downloader, UpdateOutcome};
use crate::{Error, Result};
use chrono::{DateTime, Local};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Where a download lands before validation: `<live>.update`
pub fn update_path(live: &Path) -> PathBuf {
    with_suffix(live, ".update")
}

/// Backup name for the config that was live at `at`: `<live>-YYYYMMDD-HHMMSS.backup`
pub fn backup_path(live: &Path, at: DateTime<Local>) -> PathBuf {
    with_suffix(live, &format!("-{}.backup", at.format("%Y%m%d-%H%M%S")))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

pub struct SubscriptionUpdater {
    source: String,
    live_path: PathBuf,
    downloader: Downloader,
    validator: Arc<dyn ConfigValidator>,
}

impl SubscriptionUpdater {
    pub fn new(
        source: impl Into<String>,
        live_path: impl Into<PathBuf>,
        downloader: Downloader,
        validator: Arc<dyn ConfigValidator>,
    ) -> Self {
        SubscriptionUpdater {
            source: source.into(),
            live_path: live_path.into(),
            downloader,
            validator,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    /// Run download, validate, backup and swap once
    pub async fn update_once(&self, token: &CancellationToken) -> UpdateOutcome {
        if self.source.is_empty() {
            return UpdateOutcome::Skipped;
        }

        let temp = update_path(&self.live_path);
        info!("config update...");

        if let Err(e) = self.downloader.fetch(&self.source, &temp, token).await {
            error!("config download: {}", e);
            return UpdateOutcome::DownloadFailed(e);
        }

        if let Err(e) = self.validator.validate(&temp).await {
            error!("config test: {}", e);
            if exists(&self.live_path).await {
                if let Err(live_err) = self.validator.validate(&self.live_path).await {
                    warn!("current config is invalid too: {}", live_err);
                }
            }
            return UpdateOutcome::ValidationFailed(e);
        }

        match self.commit(&temp).await {
            Ok(backup) => {
                info!("config updated: {}", self.live_path.display());
                UpdateOutcome::Committed { backup }
            }
            Err(e) => {
                error!("config save: {}", e);
                UpdateOutcome::CommitFailed(e)
            }
        }
    }

    async fn commit(&self, temp: &Path) -> Result<Option<PathBuf>> {
        let backup = if exists(&self.live_path).await {
            let backup = self.free_backup_path(Local::now()).await;
            fs::rename(&self.live_path, &backup)
                .await
                .map_err(|e| Error::fs("backup", &self.live_path, e))?;
            info!("config backup: {}", backup.display());
            Some(backup)
        } else {
            None
        };

        if let Err(e) = fs::rename(temp, &self.live_path).await {
            let err = Error::fs("rename", temp, e);
            if let Some(backup) = &backup {
                match fs::rename(backup, &self.live_path).await {
                    Ok(()) => warn!("restored previous config from {}", backup.display()),
                    Err(restore) => error!(
                        "config restore from {} failed, no live config: {}",
                        backup.display(),
                        restore
                    ),
                }
            }
            return Err(err);
        }

        Ok(backup)
    }

    /// Two commits within one second must not overwrite each other's backup
    async fn free_backup_path(&self, at: DateTime<Local>) -> PathBuf {
        let candidate = backup_path(&self.live_path, at);
        if !exists(&candidate).await {
            return candidate;
        }

        let stamp = at.format("%Y%m%d-%H%M%S");
        let mut n = 1u32;
        loop {
            let candidate = with_suffix(&self.live_path, &format!("-{}-{}.backup", stamp, n));
            if !exists(&candidate).await {
                return candidate;
            }
            n += 1;
        }
    }
}
