//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `health` - Service health checks
//! - `peripherals` - Managed peripherals and their sessions
//! - `records` - Stored CGM records and record access commands
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;

use crate::state::SharedState;

pub mod error;
pub mod health;
pub mod openapi;
pub mod peripherals;
pub mod records;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                               - Health check
/// /api
/// ├── /peripherals                      - List, add
/// │   └── /{address}                    - Get, forget
/// │       ├── /disconnect               - Disconnect
/// │       ├── /bonding                  - Report bond state
/// │       └── /records                  - List, delete
/// │           └── /{command}            - all, first, last, refresh, abort
/// └── /openapi.json                     - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest(
                    "/peripherals",
                    peripherals::router().merge(records::router()),
                ),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sensorlink_core::codec::{CgmMeasurement, SFloat};
    use sensorlink_core::{drive, Config, ConnectionState, PeripheralId, Phase};
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::state::AppState;

    const HR: &str = "AA:BB:CC:DD:EE:01";
    const CGM: &str = "AA:BB:CC:DD:EE:02";

    fn spawn_app() -> (Router, AppState) {
        let (state, transport_rx, _events) = AppState::simulated(Config::default());
        tokio::spawn(drive(state.registry_handle(), transport_rx));
        (create_router(state.clone()), state)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    /// Poll until `done` holds for the peripheral's snapshot.
    async fn wait_for(state: &AppState, address: &str, done: impl Fn(&sensorlink_core::SessionSnapshot) -> bool) {
        let id: PeripheralId = address.parse().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if done(&state.registry().await.snapshot(&id).unwrap()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn add(app: &Router, address: &str, profile: &str) {
        let (status, _) = send(
            app,
            "POST",
            "/api/peripherals",
            Some(serde_json::json!({ "address": address, "profile": profile })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _state) = spawn_app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["simulated"], true);
    }

    #[tokio::test]
    async fn test_openapi_route() {
        let (app, _state) = spawn_app();
        let (status, body) = send(&app, "GET", "/api/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["info"]["title"], "sensorlink API");
    }

    #[tokio::test]
    async fn test_add_rejects_bad_address() {
        let (app, _state) = spawn_app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/peripherals",
            Some(serde_json::json!({ "address": "nope", "profile": "heart_rate" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_ADDRESS");
    }

    #[tokio::test]
    async fn test_add_with_other_profile_conflicts() {
        let (app, _state) = spawn_app();
        add(&app, HR, "heart_rate").await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/peripherals",
            Some(serde_json::json!({ "address": HR, "profile": "continuous_glucose" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "PROFILE_MISMATCH");
    }

    #[tokio::test]
    async fn test_unknown_peripheral_is_404() {
        let (app, _state) = spawn_app();
        let (status, body) = send(&app, "GET", &format!("/api/peripherals/{HR}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "PERIPHERAL_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_peripheral_lifecycle() {
        let (app, state) = spawn_app();
        add(&app, &HR.to_lowercase(), "heart_rate").await;
        wait_for(&state, HR, |s| s.state == ConnectionState::Ready).await;

        let (status, body) = send(&app, "GET", "/api/peripherals", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["peripherals"][0]["address"], HR);
        assert_eq!(body["peripherals"][0]["state"], "ready");

        // Heart rate sensors have no record access.
        let (status, body) = send(&app, "POST", &format!("/api/peripherals/{HR}/records/all"), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "RECORD_ACCESS_UNAVAILABLE");

        let (status, _) = send(&app, "POST", &format!("/api/peripherals/{HR}/disconnect"), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        wait_for(&state, HR, |s| s.state == ConnectionState::Disconnected).await;

        let (status, _) = send(&app, "DELETE", &format!("/api/peripherals/{HR}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &format!("/api/peripherals/{HR}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_record_retrieval() {
        let (app, state) = spawn_app();
        add(&app, CGM, "continuous_glucose").await;
        wait_for(&state, CGM, |s| s.state == ConnectionState::Ready).await;

        let id: PeripheralId = CGM.parse().unwrap();
        let simulator = state.simulator().unwrap();
        for offset in 0..3_i16 {
            simulator.push_record(&id, CgmMeasurement::new(SFloat::new(100 + offset, 0).unwrap(), offset.unsigned_abs()));
        }

        let (status, body) = send(&app, "POST", &format!("/api/peripherals/{CGM}/records/all"), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["address"], CGM);
        wait_for(&state, CGM, |s| s.retrieval_phase == Phase::Idle && s.record_count == 3).await;

        let (status, body) = send(&app, "GET", &format!("/api/peripherals/{CGM}/records"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 3);
        assert_eq!(body["records"][2]["sequence_number"], 2);

        let (status, body) = send(&app, "POST", &format!("/api/peripherals/{CGM}/records/abort"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "NOTHING_TO_ABORT");

        let (status, _) = send(&app, "POST", &format!("/api/peripherals/{CGM}/records/sideways"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "DELETE", &format!("/api/peripherals/{CGM}/records"), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        wait_for(&state, CGM, |s| s.retrieval_phase == Phase::Idle && s.record_count == 0).await;
        assert_eq!(simulator.record_count(&id), 0);
    }
}
