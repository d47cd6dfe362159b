use axum::{extract::State, http::StatusCode, response::Response};
use serde::Serialize;

use crate::{
    error::Result,
    handlers::response::json,
    services::face::ExtractorStatus,
    state::AppState,
};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub face_extractor: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_extractor_error: Option<String>,
    pub active_sessions: usize,
}

/// Liveness plus face-extractor readiness.
#[axum::debug_handler]
pub async fn health(State(state): State<AppState>) -> Result<Response> {
    let (face_extractor, face_extractor_error) = match state.attendance.extraction().status() {
        ExtractorStatus::NotReady => ("not_ready", None),
        ExtractorStatus::Ready => ("ready", None),
        ExtractorStatus::Failed(reason) => ("failed", Some(reason)),
    };

    json(
        StatusCode::OK,
        &HealthResponse {
            status: "ok",
            face_extractor,
            face_extractor_error,
            active_sessions: state.attendance.active_sessions(),
        },
    )
}
