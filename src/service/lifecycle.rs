//! Foreground entry point used by the `run` verb
//!
//! Prepares the process the way the service manager would, runs the
//! program's `init` hook, then supervises `run` as a background task whose
//! token is cancelled by the first shutdown signal. When `run` ends on its own
//! inside a managed service, the manager is asked to stop the service.

use super::{Program, ServiceDescriptor, ServiceDriver};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Resolves on Ctrl-C, or SIGTERM on Unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn prepare(descriptor: &ServiceDescriptor) -> Result<()> {
    if let Some(dir) = &descriptor.working_directory {
        std::fs::create_dir_all(dir).map_err(|e| Error::fs("mkdir", dir, e))?;
        std::env::set_current_dir(dir).map_err(|e| Error::fs("chdir", dir, e))?;
    }
    for (key, value) in &descriptor.env_vars {
        std::env::set_var(key, value);
    }
    Ok(())
}

/// Run `program` until it finishes or `shutdown` resolves
pub async fn run_program<P, S>(
    program: Arc<P>,
    descriptor: &ServiceDescriptor,
    driver: Arc<dyn ServiceDriver>,
    shutdown: S,
) -> Result<()>
where
    P: Program + ?Sized,
    S: Future<Output = ()>,
{
    prepare(descriptor)?;
    program.init().await?;

    let token = CancellationToken::new();
    let mut task = {
        let program = program.clone();
        let token = token.clone();
        tokio::spawn(async move { program.run(token).await })
    };

    info!("{} running", descriptor.name);
    tokio::pin!(shutdown);

    let joined = tokio::select! {
        _ = &mut shutdown => {
            info!("shutdown signal received, stopping {}", descriptor.name);
            token.cancel();
            task.await
        }
        joined = &mut task => {
            token.cancel();
            if !driver.interactive() {
                if let Err(e) = driver.request_stop().await {
                    warn!("service stop request: {}", e);
                }
            }
            joined
        }
    };

    let result = joined.map_err(|e| Error::internal(format!("service task failed: {}", e)))?;
    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}
