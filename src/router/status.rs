//! Public instance status and Prometheus metrics.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::config::Configuration;
use crate::error::Result;
use crate::{AppState, ServerError};

/// Structured configuration.
#[derive(Serialize)]
pub struct Status {
    version: String,
    name: String,
}

/// Liveness check for load balancers.
pub async fn health() -> &'static str {
    "."
}

/// Public server status (configuration).
pub async fn status(State(config): State<Arc<Configuration>>) -> Json<Status> {
    Json(Status {
        version: config.version().to_owned(),
        name: config.name.clone(),
    })
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Result<String> {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .ok_or(ServerError::NotConfigured("metrics"))
}
