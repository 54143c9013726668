//! Public health page for load balancers and monitoring.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::AppState;

/// Structured status.
#[derive(Debug, Serialize, Deserialize)]
pub struct Status {
    pub status: String,
    pub name: String,
    pub version: String,
    /// Background units still running.
    pub in_flight: usize,
}

/// Public server status.
pub async fn handler(State(state): State<AppState>) -> Json<Status> {
    Json(Status {
        status: "available".into(),
        name: state.config.name.clone(),
        version: state.config.version().to_owned(),
        in_flight: state.runner.in_flight(),
    })
}

/// Prometheus scrape endpoint.
pub async fn metrics(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}
