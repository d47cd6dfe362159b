use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    Extension, Json,
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::Result,
    handlers::response::json,
    models::{
        principal::Principal,
        record::{AttendanceRecord, RecordFilter, RecordSummary},
        session::{AttendanceEntry, GeoPoint},
    },
    services::attendance::MarkRequest,
    state::AppState,
    validation::attendance::{CredentialKind, MarkPayload, credential_from_request},
};

/// The request payload for marking attendance.
#[derive(Deserialize, Debug, Validate)]
pub struct MarkAttendanceRequest {
    #[garde(skip)]
    pub method: CredentialKind,
    #[garde(skip)]
    pub payload: MarkPayload,
    #[garde(dive)]
    pub location: Option<GeoPoint>,
}

/// The response payload for a successful mark.
#[derive(Serialize)]
pub struct MarkResponse {
    pub success: bool,
    pub entry: AttendanceEntry,
}

/// The response payload for listing records.
#[derive(Serialize)]
pub struct RecordList {
    pub records: Vec<AttendanceRecord>,
    pub count: usize,
}

/// Marks the caller (or, for NFC, the tag's holder) present.
#[axum::debug_handler]
pub async fn mark_attendance(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<MarkAttendanceRequest>,
) -> Result<Response> {
    req.validate()?;
    tracing::debug!(
        "📝 Mark attempt by {} on session {} via {:?}",
        principal.user_id,
        session_id,
        req.method
    );

    let credential = credential_from_request(req.method, req.payload)?;
    let entry = state
        .attendance
        .mark(MarkRequest {
            session_id,
            requester: principal.user_id,
            credential,
            location: req.location,
        })
        .await?;

    json(
        StatusCode::CREATED,
        &MarkResponse {
            success: true,
            entry,
        },
    )
}

/// Lists durable attendance records, newest first.
#[axum::debug_handler]
pub async fn list_records(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(filter): Query<RecordFilter>,
) -> Result<Response> {
    let records = state
        .attendance
        .list_records(principal.user_id, filter)
        .await?;

    json(
        StatusCode::OK,
        &RecordList {
            count: records.len(),
            records,
        },
    )
}

/// Summarizes durable records by status, channel and member.
#[axum::debug_handler]
pub async fn summarize_records(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(filter): Query<RecordFilter>,
) -> Result<Response> {
    let summary: RecordSummary = state
        .attendance
        .summarize_records(principal.user_id, filter)
        .await?;

    json(StatusCode::OK, &summary)
}
