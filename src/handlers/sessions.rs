use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::Result,
    handlers::response::json,
    models::{
        principal::Principal,
        session::{AttendanceEntry, GeoPoint, Session, SessionStatus, VerificationMethod},
    },
    services::{qr::IssuedToken, sessions::OpenSession},
    state::AppState,
};

const DEFAULT_DURATION_MINUTES: i64 = 60;

/// The request payload for opening a session.
#[derive(Deserialize, Debug, Validate)]
pub struct OpenSessionRequest {
    #[garde(skip)]
    pub group_id: Uuid,
    #[garde(skip)]
    pub method: VerificationMethod,
    #[garde(range(min = 1, max = 720))]
    pub duration_minutes: Option<i64>,
    #[garde(dive)]
    pub geofence: Option<GeoPoint>,
}

/// The request payload for re-issuing a session's QR token.
#[derive(Deserialize, Debug, Default, Validate)]
pub struct RotateTokenRequest {
    #[garde(range(min = 1, max = 720))]
    pub ttl_minutes: Option<i64>,
}

/// The QR material shown to the session's authority.
#[derive(Serialize)]
pub struct QrView {
    pub payload: String,
    pub expires_at: DateTime<Utc>,
}

impl From<IssuedToken> for QrView {
    fn from(issued: IssuedToken) -> Self {
        Self {
            payload: issued.payload,
            expires_at: issued.token.expires_at,
        }
    }
}

/// A session as seen by one caller.
///
/// The authority sees the roster and the current QR payload; everyone else
/// sees the head count and whether they are on the roster.
#[derive(Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub group_id: Uuid,
    pub method: VerificationMethod,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: i64,
    pub geofence: Option<GeoPoint>,
    pub attendee_count: usize,
    pub marked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance: Option<Vec<AttendanceEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<QrView>,
}

impl SessionView {
    fn for_caller(session: Session, caller: Uuid, issued: Option<IssuedToken>) -> Self {
        let is_authority = session.authority_id == caller;
        let qr = match issued {
            Some(issued) => Some(QrView::from(issued)),
            None if is_authority => session.qr_token.as_ref().map(|token| QrView {
                payload: crate::services::qr::render_payload(session.id, token),
                expires_at: token.expires_at,
            }),
            None => None,
        };

        Self {
            id: session.id,
            group_id: session.group_id,
            method: session.method,
            status: session.status,
            started_at: session.started_at,
            ended_at: session.ended_at,
            duration_minutes: session.duration_minutes,
            geofence: session.geofence,
            attendee_count: session.attendance.len(),
            marked: session.has_entry_for(caller),
            attendance: is_authority.then_some(session.attendance),
            qr: if is_authority { qr } else { None },
        }
    }
}

/// Opens a session for one of the caller's groups.
#[axum::debug_handler]
pub async fn open_session(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<OpenSessionRequest>,
) -> Result<Response> {
    req.validate()?;

    let (session, issued) = state
        .attendance
        .open_session(OpenSession {
            group_id: req.group_id,
            authority_id: principal.user_id,
            method: req.method,
            duration_minutes: req.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES),
            geofence: req.geofence,
        })
        .await?;

    json(
        StatusCode::CREATED,
        &SessionView::for_caller(session, principal.user_id, issued),
    )
}

/// Returns a session.
#[axum::debug_handler]
pub async fn get_session(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<Uuid>,
) -> Result<Response> {
    let session = state.attendance.get_session(session_id).await?;
    json(
        StatusCode::OK,
        &SessionView::for_caller(session, principal.user_id, None),
    )
}

/// Closes a session. Only its authority may do so.
#[axum::debug_handler]
pub async fn close_session(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<Uuid>,
) -> Result<Response> {
    let session = state
        .attendance
        .close_session(session_id, principal.user_id)
        .await?;
    json(
        StatusCode::OK,
        &SessionView::for_caller(session, principal.user_id, None),
    )
}

/// Replaces a session's QR token.
#[axum::debug_handler]
pub async fn rotate_token(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<RotateTokenRequest>,
) -> Result<Response> {
    req.validate()?;

    let issued = state
        .attendance
        .rotate_token(session_id, principal.user_id, req.ttl_minutes)
        .await?;
    json(StatusCode::OK, &QrView::from(issued))
}
