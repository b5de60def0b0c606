//! Health check API endpoint.
//!
//! Provides a simple health check endpoint for monitoring and load balancers.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "radio_available": true,
    "peripherals": 2,
    "simulated": false
}))]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version from Cargo.toml.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Whether the Bluetooth radio is usable.
    pub radio_available: bool,

    /// Number of managed peripherals.
    #[schema(minimum = 0)]
    pub peripherals: usize,

    /// Whether the server runs on the simulated transport.
    pub simulated: bool,
}

/// Creates the health router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check service health",
    description = "Returns service status, radio availability and the number of \
        managed peripherals.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let registry = state.registry().await;
    Json(HealthResponse {
        status: if registry.is_stopped() { "stopping" } else { "ok" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        radio_available: registry.radio_available(),
        peripherals: registry.len(),
        simulated: state.simulator().is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            radio_available: true,
            peripherals: 0,
            simulated: true,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"radio_available\":true"));
    }
}
