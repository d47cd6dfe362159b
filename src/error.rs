use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tokio_postgres::error::SqlState;

/// The application's error type.
///
/// Every verification failure is surfaced as one of these kinds, whatever
/// channel (face, QR, NFC) produced it.
#[derive(Error, Debug)]
pub enum AppError {
    /// A session, group or member does not exist.
    #[error("Resource not found")]
    NotFound,

    /// The caller does not own the group or session.
    #[error("Not authorized")]
    NotAuthorized,

    /// The caller could not be identified.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The session is no longer accepting attendance.
    #[error("Session is closed")]
    SessionClosed,

    /// The member does not belong to the session's group.
    #[error("Member is not enrolled in this group")]
    NotEnrolled,

    /// The member already has an entry in this session.
    #[error("Attendance already marked")]
    AlreadyMarked,

    /// The member has no stored face descriptor.
    #[error("Face not registered")]
    FaceNotRegistered,

    /// The extractor found no face in the submitted image.
    #[error("No face detected in image")]
    NoFaceDetected,

    /// The face extractor has not finished initializing.
    #[error("Face extractor is not ready")]
    ExtractorNotReady,

    /// The captured descriptor did not match the stored one.
    #[error("Face verification failed")]
    VerificationFailed,

    /// The presented QR token does not match the session's current token.
    #[error("QR code does not match")]
    CodeMismatch,

    /// The session's current QR token has expired.
    #[error("QR code has expired")]
    Expired,

    /// The presented payload could not be parsed.
    #[error("Malformed payload")]
    Malformed,

    /// No member is bound to the presented NFC tag.
    #[error("Unknown NFC tag")]
    UnknownTag,

    /// The submitted location is outside the session's geofence.
    #[error("Location mismatch: {distance_meters:.0} m from session anchor")]
    LocationMismatch { distance_meters: f64 },

    /// The credential kind is not accepted by the session's method.
    #[error("Verification method not allowed for this session")]
    MethodNotAllowed,

    /// A durable record for this (session, member) already exists.
    #[error("Storage conflict")]
    StorageConflict,

    /// An external store failed or timed out.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A rate limit exceeded error.
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// A stable, machine-readable name for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::NotAuthorized => "not_authorized",
            AppError::Authentication(_) => "authentication",
            AppError::SessionClosed => "session_closed",
            AppError::NotEnrolled => "not_enrolled",
            AppError::AlreadyMarked => "already_marked",
            AppError::FaceNotRegistered => "face_not_registered",
            AppError::NoFaceDetected => "no_face_detected",
            AppError::ExtractorNotReady => "extractor_not_ready",
            AppError::VerificationFailed => "verification_failed",
            AppError::CodeMismatch => "code_mismatch",
            AppError::Expired => "expired",
            AppError::Malformed => "malformed",
            AppError::UnknownTag => "unknown_tag",
            AppError::LocationMismatch { .. } => "location_mismatch",
            AppError::MethodNotAllowed => "method_not_allowed",
            AppError::StorageConflict => "storage_conflict",
            AppError::StorageUnavailable(_) => "storage_unavailable",
            AppError::Validation(_) => "validation",
            AppError::RateLimitExceeded(_) => "rate_limit_exceeded",
            AppError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound | AppError::UnknownTag => StatusCode::NOT_FOUND,
            AppError::NotAuthorized | AppError::NotEnrolled | AppError::LocationMismatch { .. } => {
                StatusCode::FORBIDDEN
            }
            AppError::Authentication(_)
            | AppError::VerificationFailed
            | AppError::CodeMismatch
            | AppError::Expired => StatusCode::UNAUTHORIZED,
            AppError::SessionClosed | AppError::AlreadyMarked | AppError::StorageConflict => {
                StatusCode::CONFLICT
            }
            AppError::FaceNotRegistered
            | AppError::NoFaceDetected
            | AppError::Malformed
            | AppError::MethodNotAllowed
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::StorageUnavailable(_) | AppError::ExtractorNotReady => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
            return AppError::StorageConflict;
        }
        AppError::StorageUnavailable(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::StorageUnavailable(e.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::StorageUnavailable(format!("redis: {}", e))
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AppError::StorageUnavailable("timed out".to_string())
    }
}

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        AppError::Validation(report.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match self {
            AppError::StorageUnavailable(ref e) => {
                tracing::error!("Storage unavailable: {}", e);
                "Storage unavailable".to_string()
            }
            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            AppError::Authentication(ref msg) => {
                tracing::warn!("Authentication failed: {}", msg);
                msg.clone()
            }
            AppError::NotAuthorized => {
                tracing::warn!("Authorization failed");
                self.to_string()
            }
            AppError::RateLimitExceeded(ref msg) => {
                tracing::warn!("Rate limit exceeded: {}", msg);
                msg.clone()
            }
            ref other => {
                tracing::debug!("Request rejected: {}", other);
                other.to_string()
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message,
            "kind": self.kind(),
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error","kind":"internal"}"#.to_string());

        (
            status,
            [(http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_failures_map_to_distinct_kinds() {
        assert_eq!(AppError::CodeMismatch.kind(), "code_mismatch");
        assert_eq!(AppError::Expired.kind(), "expired");
        assert_eq!(AppError::Malformed.kind(), "malformed");
        assert_eq!(
            AppError::LocationMismatch { distance_meters: 1112.0 }.kind(),
            "location_mismatch"
        );
    }

    #[test]
    fn duplicate_outcomes_are_conflicts() {
        assert_eq!(AppError::AlreadyMarked.status(), StatusCode::CONFLICT);
        assert_eq!(AppError::StorageConflict.status(), StatusCode::CONFLICT);
        assert_eq!(AppError::SessionClosed.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn storage_failures_are_unavailable() {
        let err = AppError::StorageUnavailable("timed out".into());
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
