//! Fallback driver for hosts without a supported service manager

use super::{ServiceDriver, ServiceStatus};
use crate::{Error, Result};
use async_trait::async_trait;

/// Every management call reports [`Error::Unsupported`]; `run` still works
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedDriver;

#[async_trait]
impl ServiceDriver for UnsupportedDriver {
    async fn status(&self) -> Result<ServiceStatus> {
        Err(Error::Unsupported)
    }

    async fn start(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    async fn stop(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    async fn install(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    async fn uninstall(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn interactive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_everything_unsupported() {
        let driver = UnsupportedDriver;
        assert!(matches!(driver.status().await, Err(Error::Unsupported)));
        assert!(matches!(driver.install().await, Err(Error::Unsupported)));
        assert!(matches!(driver.request_stop().await, Err(Error::Unsupported)));
        assert!(driver.interactive());
    }
}
