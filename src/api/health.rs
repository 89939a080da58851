use axum::{extract::State, Json};
use serde::Serialize;

use crate::error::Result;
use crate::hub::Stats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.hub.is_running() {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /stats - consistent snapshot of connections and subscriptions
pub async fn stats(State(state): State<AppState>) -> Result<Json<Stats>> {
    Ok(Json(state.hub.stats().await?))
}
