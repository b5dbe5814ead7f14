//! Configs endpoints
//!
//! Reports the applied configuration and triggers reloads of the live file.

use super::common::{ApiError, ApiResult};
use super::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::info;

/// GET /configs - Get current configuration
pub async fn get_configs(State(state): State<AppState>) -> Json<Value> {
    let config = state.config.read().await;

    Json(json!({
        "port": config.port,
        "socks-port": config.socks_port,
        "mixed-port": config.mixed_port,
        "allow-lan": config.allow_lan,
        "bind-address": config.bind_address.as_deref().unwrap_or("*"),
        "mode": config.mode,
        "log-level": config.log_level,
    }))
}

/// PUT /configs - Reload the live config file
pub async fn reload_configs(State(state): State<AppState>) -> ApiResult<StatusCode> {
    info!("Reload requested through the controller");
    state
        .reload
        .request()
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}
