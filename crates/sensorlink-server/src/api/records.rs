//! Stored record API endpoints.
//!
//! Continuous glucose monitors keep records that are pulled over the record
//! access control point. Retrieval runs in the background: a command is
//! accepted, records arrive one by one, and `phase` returns to `idle` when
//! the peripheral reports the outcome.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use sensorlink_core::units::mg_per_dl_to_mmol_per_l;
use sensorlink_core::{Phase, Record, RetrievalCommand};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::api::peripherals::parse_address;
use crate::state::SharedState;

/// Creates the records router; nested under `/api/peripherals`.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/{address}/records", get(get_records).delete(delete_records))
        .route("/{address}/records/{command}", post(start_retrieval))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// A stored glucose record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "sequence_number": 42,
    "timestamp": "2025-01-15T03:30:00+00:00",
    "glucose_mg_dl": 112.0,
    "glucose_mmol_l": 6.2,
    "trend": -0.5,
    "quality": null,
    "warning": null,
    "cal_temp": null,
    "status": null
}))]
pub struct RecordEntry {
    /// Minutes since the sensor session started.
    #[schema(example = 42)]
    pub sequence_number: u16,

    /// Absolute time (RFC 3339) when the session start time is known.
    pub timestamp: Option<String>,

    /// Glucose concentration in mg/dL.
    pub glucose_mg_dl: f32,

    /// Glucose concentration in mmol/L.
    pub glucose_mmol_l: f32,

    /// Rate of change in (mg/dL)/min.
    pub trend: Option<f32>,

    /// Quality in percent.
    pub quality: Option<f32>,

    /// Sensor status annunciation, warning octet.
    pub warning: Option<u8>,

    /// Sensor status annunciation, calibration/temperature octet.
    pub cal_temp: Option<u8>,

    /// Sensor status annunciation, status octet.
    pub status: Option<u8>,
}

impl From<&Record> for RecordEntry {
    fn from(record: &Record) -> Self {
        let m = &record.measurement;
        Self {
            sequence_number: record.sequence_number,
            timestamp: record.timestamp.map(|t| t.to_rfc3339()),
            glucose_mg_dl: m.glucose_concentration.value(),
            glucose_mmol_l: mg_per_dl_to_mmol_per_l(m.glucose_concentration.value()),
            trend: m.trend.map(|t| t.value()),
            quality: m.quality.map(|q| q.value()),
            warning: m.warning,
            cal_temp: m.cal_temp,
            status: m.status,
        }
    }
}

/// Records held for one peripheral.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RecordsResponse {
    /// Bluetooth address.
    #[schema(example = "C4:7C:8D:6A:3E:01")]
    pub address: String,

    /// Retrieval phase.
    pub phase: Phase,

    /// Number of records held.
    #[schema(minimum = 0)]
    pub count: usize,

    /// Records in sequence order.
    pub records: Vec<RecordEntry>,
}

/// Outcome of an accepted record access command.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RetrievalResponse {
    /// Bluetooth address.
    #[schema(example = "C4:7C:8D:6A:3E:01")]
    pub address: String,

    /// Retrieval phase after the command was accepted.
    pub phase: Phase,

    /// Records held when the command was accepted.
    #[schema(minimum = 0)]
    pub record_count: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// Map a path segment to a retrieval command.
fn parse_command(command: &str) -> ApiResult<RetrievalCommand> {
    match command {
        "all" => Ok(RetrievalCommand::All),
        "first" => Ok(RetrievalCommand::First),
        "last" => Ok(RetrievalCommand::Last),
        "refresh" => Ok(RetrievalCommand::Since),
        "abort" => Ok(RetrievalCommand::Abort),
        other => Err(ApiError::BadRequest {
            error_code: "UNKNOWN_COMMAND".to_string(),
            message: format!(
                "Unknown record command '{other}'. Expected one of: all, first, last, refresh, abort."
            ),
        }),
    }
}

async fn run(
    state: &SharedState,
    address: &str,
    command: RetrievalCommand,
) -> ApiResult<(StatusCode, Json<RetrievalResponse>)> {
    let id = parse_address(address)?;
    let mut registry = state.registry().await;
    registry.retrieval(&id, command, Instant::now())?;
    let snapshot = registry.snapshot(&id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RetrievalResponse {
            address: snapshot.address,
            phase: snapshot.retrieval_phase,
            record_count: snapshot.record_count,
        }),
    ))
}

/// List the records held for a peripheral.
#[utoipa::path(
    get,
    path = "/api/peripherals/{address}/records",
    tag = "records",
    operation_id = "getRecords",
    summary = "List stored records",
    description = "Returns the records received so far, in sequence order. \
        Records survive disconnects and are dropped when the peripheral is forgotten.",
    params(("address" = String, Path, description = "Bluetooth address")),
    responses(
        (status = 200, description = "Records listed", body = RecordsResponse),
        (status = 404, description = "Not managed", body = super::error::ErrorResponse)
    )
)]
pub async fn get_records(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<RecordsResponse>> {
    let id = parse_address(&address)?;
    let registry = state.registry().await;
    let phase = registry.snapshot(&id)?.retrieval_phase;
    let records: Vec<RecordEntry> = registry.records(&id)?.iter().map(RecordEntry::from).collect();
    Ok(Json(RecordsResponse {
        address: id.to_string(),
        phase,
        count: records.len(),
        records,
    }))
}

/// Start or abort a record retrieval.
#[utoipa::path(
    post,
    path = "/api/peripherals/{address}/records/{command}",
    tag = "records",
    operation_id = "startRetrieval",
    summary = "Run a record access command",
    description = "`all`, `first` and `last` request those records; `refresh` \
        requests only records newer than the newest one held; `abort` stops a \
        running retrieval.",
    params(
        ("address" = String, Path, description = "Bluetooth address"),
        ("command" = String, Path, description = "One of all, first, last, refresh, abort")
    ),
    responses(
        (status = 202, description = "Command accepted", body = RetrievalResponse),
        (status = 400, description = "Unknown command", body = super::error::ErrorResponse),
        (status = 404, description = "Not managed", body = super::error::ErrorResponse),
        (status = 409, description = "Not ready, busy, or nothing to abort", body = super::error::ErrorResponse),
        (status = 422, description = "Profile has no record access", body = super::error::ErrorResponse)
    )
)]
pub async fn start_retrieval(
    State(state): State<SharedState>,
    Path((address, command)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<RetrievalResponse>)> {
    let command = parse_command(&command)?;
    run(&state, &address, command).await
}

/// Delete every record on the peripheral.
#[utoipa::path(
    delete,
    path = "/api/peripherals/{address}/records",
    tag = "records",
    operation_id = "deleteRecords",
    summary = "Delete stored records",
    description = "Asks the peripheral to delete all stored records. Local \
        records are cleared once the peripheral confirms.",
    params(("address" = String, Path, description = "Bluetooth address")),
    responses(
        (status = 202, description = "Delete accepted", body = RetrievalResponse),
        (status = 404, description = "Not managed", body = super::error::ErrorResponse),
        (status = 409, description = "Not ready or busy", body = super::error::ErrorResponse),
        (status = 422, description = "Profile has no record access", body = super::error::ErrorResponse)
    )
)]
pub async fn delete_records(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<(StatusCode, Json<RetrievalResponse>)> {
    run(&state, &address, RetrievalCommand::DeleteAll).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorlink_core::codec::{CgmMeasurement, SFloat};

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("refresh").unwrap(), RetrievalCommand::Since);
        assert_eq!(parse_command("abort").unwrap(), RetrievalCommand::Abort);
        assert!(matches!(
            parse_command("everything"),
            Err(ApiError::BadRequest { .. })
        ));
    }

    #[test]
    fn test_record_entry_from_record() {
        let mut measurement = CgmMeasurement::new(SFloat::new(112, 0).unwrap(), 42);
        measurement.status = Some(0x01);
        let record = Record::new(measurement, None);

        let entry = RecordEntry::from(&record);
        assert_eq!(entry.sequence_number, 42);
        assert!((entry.glucose_mg_dl - 112.0).abs() < f32::EPSILON);
        assert!((entry.glucose_mmol_l - 6.22).abs() < 0.01);
        assert_eq!(entry.status, Some(0x01));
        assert!(entry.timestamp.is_none());
    }
}
