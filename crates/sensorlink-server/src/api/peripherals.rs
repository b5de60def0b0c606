//! Peripheral management API endpoints.
//!
//! A peripheral is managed once it is added: the registry keeps a session for
//! it, connects, and reconnects when the radio comes back. Commands return as
//! soon as they are accepted; progress shows up in the session snapshot.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use sensorlink_core::{PeripheralHandle, PeripheralId, Profile, SessionSnapshot};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the peripherals router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_peripherals).post(add_peripheral))
        .route("/{address}", get(get_peripheral).delete(forget_peripheral))
        .route("/{address}/disconnect", post(disconnect_peripheral))
        .route("/{address}/bonding", post(set_bonding))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Every managed peripheral.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PeripheralListResponse {
    /// Snapshots ordered by address.
    pub peripherals: Vec<SessionSnapshot>,

    /// Number of managed peripherals.
    #[schema(example = 1, minimum = 0)]
    pub count: usize,
}

/// Request body for adding a peripheral.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "address": "C4:7C:8D:6A:3E:01",
    "name": "Chest strap",
    "profile": "heart_rate"
}))]
pub struct AddPeripheralRequest {
    /// Bluetooth address, any case.
    #[schema(example = "C4:7C:8D:6A:3E:01")]
    pub address: String,

    /// Optional display name.
    pub name: Option<String>,

    /// Profile to speak.
    pub profile: Profile,
}

/// Request body reporting a bond change made outside the server.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "bonded": true }))]
pub struct BondingRequest {
    /// Whether the peripheral is now bonded.
    pub bonded: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// Parse a path or body address into a peripheral id.
pub(crate) fn parse_address(address: &str) -> ApiResult<PeripheralId> {
    Ok(address.parse::<PeripheralId>()?)
}

/// List all managed peripherals.
#[utoipa::path(
    get,
    path = "/api/peripherals",
    tag = "peripherals",
    operation_id = "listPeripherals",
    summary = "List managed peripherals",
    responses(
        (status = 200, description = "Peripherals listed", body = PeripheralListResponse)
    )
)]
pub async fn list_peripherals(State(state): State<SharedState>) -> Json<PeripheralListResponse> {
    let peripherals = state.registry().await.snapshots();
    Json(PeripheralListResponse {
        count: peripherals.len(),
        peripherals,
    })
}

/// Manage a peripheral and connect to it.
#[utoipa::path(
    post,
    path = "/api/peripherals",
    tag = "peripherals",
    operation_id = "addPeripheral",
    summary = "Add and connect a peripheral",
    description = "Starts managing the peripheral and connects to it. Adding an \
        already connected peripheral is a no-op. The connection proceeds in the \
        background; poll the snapshot until `state` is `ready`.",
    request_body = AddPeripheralRequest,
    responses(
        (status = 202, description = "Connect accepted", body = SessionSnapshot),
        (status = 400, description = "Invalid address", body = super::error::ErrorResponse),
        (status = 409, description = "Already managed with another profile", body = super::error::ErrorResponse),
        (status = 422, description = "Peripheral known to be unsupported", body = super::error::ErrorResponse),
        (status = 503, description = "Registry stopped or transport failure", body = super::error::ErrorResponse)
    )
)]
pub async fn add_peripheral(
    State(state): State<SharedState>,
    Json(request): Json<AddPeripheralRequest>,
) -> ApiResult<(StatusCode, Json<SessionSnapshot>)> {
    let id = parse_address(&request.address)?;
    let handle = match request.name {
        Some(name) => PeripheralHandle::new(id.clone()).with_name(name),
        None => PeripheralHandle::new(id.clone()),
    };
    state.connect(handle, request.profile).await?;
    let snapshot = state.registry().await.snapshot(&id)?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

/// Get one peripheral.
#[utoipa::path(
    get,
    path = "/api/peripherals/{address}",
    tag = "peripherals",
    operation_id = "getPeripheral",
    summary = "Get a peripheral's session",
    params(("address" = String, Path, description = "Bluetooth address")),
    responses(
        (status = 200, description = "Session snapshot", body = SessionSnapshot),
        (status = 404, description = "Not managed", body = super::error::ErrorResponse)
    )
)]
pub async fn get_peripheral(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<SessionSnapshot>> {
    let id = parse_address(&address)?;
    Ok(Json(state.registry().await.snapshot(&id)?))
}

/// Stop managing a peripheral.
#[utoipa::path(
    delete,
    path = "/api/peripherals/{address}",
    tag = "peripherals",
    operation_id = "forgetPeripheral",
    summary = "Forget a peripheral",
    description = "Disconnects if needed and drops the session and its records.",
    params(("address" = String, Path, description = "Bluetooth address")),
    responses(
        (status = 204, description = "Forgotten"),
        (status = 404, description = "Not managed", body = super::error::ErrorResponse)
    )
)]
pub async fn forget_peripheral(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_address(&address)?;
    state.registry().await.forget(&id, Instant::now())?;
    Ok(StatusCode::NO_CONTENT)
}

/// Disconnect a peripheral but keep managing it.
#[utoipa::path(
    post,
    path = "/api/peripherals/{address}/disconnect",
    tag = "peripherals",
    operation_id = "disconnectPeripheral",
    summary = "Disconnect a peripheral",
    params(("address" = String, Path, description = "Bluetooth address")),
    responses(
        (status = 202, description = "Disconnect accepted", body = SessionSnapshot),
        (status = 404, description = "Not managed", body = super::error::ErrorResponse)
    )
)]
pub async fn disconnect_peripheral(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<(StatusCode, Json<SessionSnapshot>)> {
    let id = parse_address(&address)?;
    let mut registry = state.registry().await;
    registry.disconnect(&id, Instant::now())?;
    Ok((StatusCode::ACCEPTED, Json(registry.snapshot(&id)?)))
}

/// Report a bond change.
#[utoipa::path(
    post,
    path = "/api/peripherals/{address}/bonding",
    tag = "peripherals",
    operation_id = "setBonding",
    summary = "Report bonding outcome",
    description = "Tells the session that bonding finished outside the server. \
        A successful bond resumes operations paused for authentication.",
    params(("address" = String, Path, description = "Bluetooth address")),
    request_body = BondingRequest,
    responses(
        (status = 202, description = "Bond state applied", body = SessionSnapshot),
        (status = 404, description = "Not managed", body = super::error::ErrorResponse)
    )
)]
pub async fn set_bonding(
    State(state): State<SharedState>,
    Path(address): Path<String>,
    Json(request): Json<BondingRequest>,
) -> ApiResult<(StatusCode, Json<SessionSnapshot>)> {
    let id = parse_address(&address)?;
    let mut registry = state.registry().await;
    registry.set_bonded(&id, request.bonded, Instant::now())?;
    Ok((StatusCode::ACCEPTED, Json(registry.snapshot(&id)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_request_deserialization() {
        let json = r#"{"address": "aa:bb:cc:dd:ee:ff", "profile": "continuous_glucose"}"#;
        let request: AddPeripheralRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.profile, Profile::ContinuousGlucose);
        assert!(request.name.is_none());
    }

    #[test]
    fn test_parse_address_normalizes() {
        let id = parse_address("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:FF");
        assert!(parse_address("not-an-address").is_err());
    }
}
