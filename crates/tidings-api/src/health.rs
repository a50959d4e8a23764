use axum::{Json, extract::State};

use tidings_types::api::HealthResponse;

use crate::auth::AppState;

/// GET /v1/healthcheck
pub async fn healthcheck(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.broker.supervisor().is_shutting_down() {
        "shutting down"
    } else {
        "available"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.broker.registry().len(),
    })
}
