//! Periodic subscription refresh

use super::{SubscriptionUpdater, UpdateOutcome};
use crate::engine::ReloadHandle;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Drives the updater on a fixed period. Cycles never overlap: the next tick
/// is only awaited once the previous update has finished.
pub struct UpdateScheduler {
    updater: Arc<SubscriptionUpdater>,
    interval: Duration,
    reload: Option<ReloadHandle>,
}

impl UpdateScheduler {
    /// `reload` is `None` when no engine runs in this process
    pub fn new(
        updater: Arc<SubscriptionUpdater>,
        interval: Duration,
        reload: Option<ReloadHandle>,
    ) -> Self {
        UpdateScheduler {
            updater,
            interval,
            reload,
        }
    }

    /// One update without a reload, used before the engine is up
    pub async fn update_now(&self, token: &CancellationToken) -> UpdateOutcome {
        let outcome = self.updater.update_once(token).await;
        log_outcome(&outcome);
        outcome
    }

    /// One scheduled cycle: update, then reload if a new config went live
    pub async fn cycle(&self, token: &CancellationToken) -> UpdateOutcome {
        let outcome = self.update_now(token).await;
        if outcome.is_committed() {
            if let Some(reload) = &self.reload {
                if let Err(e) = reload.request() {
                    error!("config reload: {}", e);
                }
            }
        }
        outcome
    }

    /// Immediate update followed by the periodic loop
    pub async fn run(self, token: CancellationToken) {
        self.cycle(&token).await;
        self.run_periodic(token).await;
    }

    /// Periodic loop only; the first update happens one interval from now
    pub async fn run_periodic(self, token: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.log_next_update();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = self.cycle(&token).await;
                    if outcome.is_cancelled() {
                        break;
                    }
                    self.log_next_update();
                }
            }
        }

        debug!("subscription scheduler stopped");
    }

    fn log_next_update(&self) {
        if self.updater.source().is_empty() {
            return;
        }
        let next = chrono::Duration::from_std(self.interval)
            .ok()
            .and_then(|d| Local::now().checked_add_signed(d));
        if let Some(next) = next {
            info!("config next update at {}", next.to_rfc3339());
        }
    }
}

fn log_outcome(outcome: &UpdateOutcome) {
    match outcome {
        UpdateOutcome::Skipped => debug!("config update: {}", outcome),
        UpdateOutcome::Committed { .. } => info!("config update: {}", outcome),
        _ if outcome.is_cancelled() => debug!("config update cancelled"),
        _ => error!("config update: {}", outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reload;
    use crate::subscription::testing::MockSubscription;
    use crate::subscription::{ConfigValidator, Downloader, RetryPolicy, ATTEMPT_TIMEOUT};
    use crate::Result;
    use async_trait::async_trait;
    use std::path::Path;

    struct AcceptAll;

    #[async_trait]
    impl ConfigValidator for AcceptAll {
        async fn validate(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn updater(url: String, live: &Path, policy: RetryPolicy) -> Arc<SubscriptionUpdater> {
        let downloader = Downloader::with_policy(policy, ATTEMPT_TIMEOUT).unwrap();
        Arc::new(SubscriptionUpdater::new(url, live, downloader, Arc::new(AcceptAll)))
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_cycle_requests_reload_on_commit() {
        let server = MockSubscription::start(vec![200], "mixed-port: 7890\n").await;
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("config.yaml");
        let (handle, mut rx) = reload::channel();

        let scheduler =
            UpdateScheduler::new(updater(server.url(), &live, fast()), Duration::from_secs(3600), Some(handle));
        let outcome = scheduler.cycle(&CancellationToken::new()).await;

        assert!(outcome.is_committed());
        assert!(rx.try_recv());
    }

    #[tokio::test]
    async fn test_failed_cycle_does_not_reload() {
        let server = MockSubscription::start(vec![500], "").await;
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("config.yaml");
        let (handle, mut rx) = reload::channel();

        let scheduler =
            UpdateScheduler::new(updater(server.url(), &live, fast()), Duration::from_secs(3600), Some(handle));
        let outcome = scheduler.cycle(&CancellationToken::new()).await;

        assert!(matches!(outcome, UpdateOutcome::DownloadFailed(_)));
        assert!(!rx.try_recv());
    }

    #[tokio::test]
    async fn test_run_updates_immediately_and_periodically() {
        let server = MockSubscription::start(vec![500, 200, 200], "mixed-port: 7890\n").await;
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("config.yaml");

        let scheduler =
            UpdateScheduler::new(updater(server.url(), &live, fast()), Duration::from_millis(50), None);
        let token = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        // the failed first attempt did not stop the loop
        assert!(server.hits() >= 3);
        assert_eq!(std::fs::read_to_string(&live).unwrap(), "mixed-port: 7890\n");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let server = MockSubscription::start(vec![500], "").await;
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("config.yaml");

        let scheduler = UpdateScheduler::new(
            updater(server.url(), &live, RetryPolicy::default()),
            Duration::from_secs(3600),
            None,
        );
        let token = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.hits(), 1);
    }
}
