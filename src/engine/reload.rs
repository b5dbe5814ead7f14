//! Reload requests for the engine control loop
//!
//! A single-slot channel: requests that arrive while one is already pending
//! collapse into it, since a reload always reads the latest file anyway.

use crate::{Error, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Create a connected handle/receiver pair
pub fn channel() -> (ReloadHandle, ReloadReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (ReloadHandle { tx }, ReloadReceiver { rx })
}

/// Requests a reload; cheap to clone
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    tx: mpsc::Sender<()>,
}

impl ReloadHandle {
    pub fn request(&self) -> Result<()> {
        match self.tx.try_send(()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("reload already pending");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                Err(Error::internal("engine control loop is not running"))
            }
        }
    }
}

/// Owned by the engine control loop
#[derive(Debug)]
pub struct ReloadReceiver {
    rx: mpsc::Receiver<()>,
}

impl ReloadReceiver {
    /// Wait for the next request; `None` once every handle is dropped
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Consume a pending request without waiting
    pub fn try_recv(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

/// Turn SIGHUP into reload requests so `kill -HUP` keeps working
#[cfg(unix)]
pub fn forward_hangup(
    handle: ReloadHandle,
    token: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    debug!("SIGHUP received");
                    if let Err(e) = handle.request() {
                        tracing::warn!("config reload: {}", e);
                    }
                }
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn forward_hangup(
    _handle: ReloadHandle,
    _token: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async {}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_coalesce() {
        let (handle, mut rx) = channel();
        handle.request().unwrap();
        handle.clone().request().unwrap();
        handle.request().unwrap();

        assert!(rx.try_recv());
        assert!(!rx.try_recv());
    }

    #[tokio::test]
    async fn test_request_after_receiver_dropped() {
        let (handle, rx) = channel();
        drop(rx);
        assert!(matches!(handle.request(), Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_recv_ends_when_handles_dropped() {
        let (handle, mut rx) = channel();
        handle.request().unwrap();
        drop(handle);
        assert_eq!(rx.recv().await, Some(()));
        assert_eq!(rx.recv().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hangup_is_forwarded() {
        let (handle, mut rx) = channel();
        let token = CancellationToken::new();
        let task = forward_hangup(handle, token.clone()).unwrap();

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGHUP).unwrap();
        let received = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await;
        assert_eq!(received.unwrap(), Some(()));

        token.cancel();
        task.await.unwrap();
    }
}
