//! Subscription updates
//!
//! ```text
//! scheduler --tick--> updater --> fetcher (config.yaml.update)
//!                        |
//!                        +--> validator --> backup --> rename --> reload
//! ```

mod fetcher;
mod scheduler;
mod updater;

#[cfg(test)]
pub(crate) mod testing;

pub use fetcher::{Downloader, RetryPolicy, ATTEMPT_TIMEOUT, CONNECT_TIMEOUT};
pub use scheduler::UpdateScheduler;
pub use updater::{backup_path, update_path, SubscriptionUpdater};

use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

/// Checks a downloaded document before it may replace the live config
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    async fn validate(&self, path: &Path) -> Result<()>;
}

/// Result of one update attempt
#[derive(Debug)]
pub enum UpdateOutcome {
    /// No subscription configured
    Skipped,
    /// The download did not produce a file
    DownloadFailed(Error),
    /// The downloaded document was rejected; live config untouched
    ValidationFailed(Error),
    /// Backup or final rename failed
    CommitFailed(Error),
    /// The downloaded document is now live
    Committed { backup: Option<PathBuf> },
}

impl UpdateOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, UpdateOutcome::Committed { .. })
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            UpdateOutcome::DownloadFailed(e)
            | UpdateOutcome::ValidationFailed(e)
            | UpdateOutcome::CommitFailed(e) => Some(e),
            UpdateOutcome::Skipped | UpdateOutcome::Committed { .. } => None,
        }
    }

    /// True when the attempt ended because the process is shutting down
    pub fn is_cancelled(&self) -> bool {
        matches!(self.error(), Some(Error::Cancelled))
    }
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOutcome::Skipped => write!(f, "skipped (no subscription)"),
            UpdateOutcome::DownloadFailed(e) => write!(f, "download failed: {}", e),
            UpdateOutcome::ValidationFailed(e) => write!(f, "validation failed: {}", e),
            UpdateOutcome::CommitFailed(e) => write!(f, "commit failed: {}", e),
            UpdateOutcome::Committed { backup: Some(path) } => {
                write!(f, "committed (backup {})", path.display())
            }
            UpdateOutcome::Committed { backup: None } => write!(f, "committed"),
        }
    }
}
