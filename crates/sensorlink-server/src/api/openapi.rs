//! OpenAPI specification for the sensorlink API.
//!
//! Served at `/api/openapi.json` and written to disk by the `gen-openapi`
//! binary for client generation.

use axum::Json;
use sensorlink_core::{ConnectionState, DisconnectReason, Phase, Profile, SessionSnapshot};
use utoipa::OpenApi;

use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::peripherals::{AddPeripheralRequest, BondingRequest, PeripheralListResponse};
use super::records::{RecordEntry, RecordsResponse, RetrievalResponse};

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// The OpenAPI specification as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for sensorlink.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "sensorlink API",
        version = "0.1.0",
        description = r#"
# sensorlink API

sensorlink connects to Bluetooth Low Energy health sensors and keeps a
session open with each of them.

## Overview

1. **Peripherals**: add a sensor with its address and profile (heart rate,
   blood pressure, cycling or running speed and cadence, thermometer,
   continuous glucose). The server connects, checks the sensor exposes what
   the profile needs, subscribes to measurements and reconnects when the
   radio comes back.
2. **Records**: continuous glucose monitors keep a history that is pulled
   with record access commands. Records are held per peripheral until it is
   forgotten.

## Asynchronous commands

Commands return `202 Accepted` once validated. Poll the peripheral snapshot
for `state`, `retrieval_phase` and `record_count` to follow progress.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local sensorlink server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "peripherals", description = "Managed sensors and their sessions"),
        (name = "records", description = "Stored glucose records and record access commands")
    ),
    paths(
        super::health::health_check,
        super::peripherals::list_peripherals,
        super::peripherals::add_peripheral,
        super::peripherals::get_peripheral,
        super::peripherals::forget_peripheral,
        super::peripherals::disconnect_peripheral,
        super::peripherals::set_bonding,
        super::records::get_records,
        super::records::start_retrieval,
        super::records::delete_records,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            SessionSnapshot,
            Profile,
            ConnectionState,
            DisconnectReason,
            Phase,
            PeripheralListResponse,
            AddPeripheralRequest,
            BondingRequest,
            RecordEntry,
            RecordsResponse,
            RetrievalResponse,
        )
    )
)]
pub struct ApiDoc;
