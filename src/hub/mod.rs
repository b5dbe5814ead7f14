//! External controller (hub)
//!
//! A small REST surface over the running engine: version, applied config and
//! a reload trigger. Optionally serves the dashboard directory under `/ui`.

mod auth;
mod common;
mod configs;

pub use auth::auth_middleware;
pub use common::{ApiError, ApiResult};

use crate::config::Config;
use crate::engine::ReloadHandle;
use crate::{Error, Result, VERSION};

use axum::{
    middleware,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// API secret for authentication
    pub secret: String,
    /// Applied configuration
    pub config: Arc<RwLock<Config>>,
    /// Reload trigger for the engine control loop
    pub reload: ReloadHandle,
}

impl AppState {
    pub fn new(secret: String, config: Arc<RwLock<Config>>, reload: ReloadHandle) -> Self {
        AppState {
            secret,
            config,
            reload,
        }
    }
}

/// Create the controller router
pub fn create_router(state: AppState, ui_dir: Option<PathBuf>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/", get(hello))
        .route("/version", get(version))
        .route("/configs", get(configs::get_configs).put(configs::reload_configs));

    if let Some(dir) = ui_dir {
        router = router.nest_service("/ui", ServeDir::new(dir));
    }

    router
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Clash accepts `:9090` as "all interfaces"
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// A running controller server
pub struct Controller {
    addr: SocketAddr,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Controller {
    /// Bind `addr` and serve until `token` is cancelled
    pub async fn spawn(
        addr: &str,
        state: AppState,
        ui_dir: Option<PathBuf>,
        token: CancellationToken,
    ) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(normalize_addr(addr))
            .await
            .map_err(|e| Error::config(format!("external controller {}: {}", addr, e)))?;
        let local = listener.local_addr()?;
        let router = create_router(state, ui_dir);

        let shutdown = token.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!("REST API server error: {}", e);
            }
        });

        info!("RESTful API listening at: {}", local);
        Ok(Controller {
            addr: local,
            token,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait up to `timeout` for the server task
    pub async fn shutdown(self, timeout: Duration) {
        self.token.cancel();
        if tokio::time::timeout(timeout, self.handle).await.is_err() {
            warn!("REST API server on {} did not stop in time", self.addr);
        }
    }
}

async fn hello() -> Json<Value> {
    Json(json!({ "hello": "hlash" }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": format!("hlash {}", VERSION),
        "meta": false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reload;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state(secret: &str) -> (AppState, crate::engine::ReloadReceiver) {
        let (handle, rx) = reload::channel();
        let config = Config::from_str("mixed-port: 7890\n").unwrap();
        (
            AppState::new(secret.to_string(), Arc::new(RwLock::new(config)), handle),
            rx,
        )
    }

    #[tokio::test]
    async fn test_hello() {
        let response = hello().await;
        assert_eq!(response.0["hello"], "hlash");
    }

    #[tokio::test]
    async fn test_version() {
        let response = version().await;
        assert!(response.0["version"].as_str().unwrap().contains(VERSION));
    }

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr(":9090"), "0.0.0.0:9090");
        assert_eq!(normalize_addr("127.0.0.1:9090"), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_configs_requires_secret() {
        let (state, _rx) = state("s3cret");
        let router = create_router(state, None);

        let response = router
            .clone()
            .oneshot(Request::get("/configs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .clone()
            .oneshot(Request::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(
                Request::get("/configs")
                    .header("authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ui_prefix_lookalike_requires_secret() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        let (state, _rx) = state("s3cret");
        let router = create_router(state, Some(dir.path().to_path_buf()));

        let response = router
            .clone()
            .oneshot(Request::get("/ui/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::get("/uifoo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_put_configs_requests_reload() {
        let (state, mut rx) = state("");
        let router = create_router(state, None);

        let response = router
            .oneshot(Request::put("/configs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(rx.try_recv());
    }

    #[tokio::test]
    async fn test_controller_spawn_and_shutdown() {
        let (state, _rx) = state("");
        let token = CancellationToken::new();
        let controller = Controller::spawn("127.0.0.1:0", state, None, token)
            .await
            .unwrap();
        let addr = controller.local_addr();
        assert_ne!(addr.port(), 0);

        let stream = tokio::net::TcpStream::connect(addr).await;
        assert!(stream.is_ok());
        drop(stream);

        controller.shutdown(Duration::from_secs(2)).await;
    }
}
