use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::token;
use crate::error::AppError;
use crate::models::session::QrToken;

/// What gets encoded into the displayed QR image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrPayload {
    pub session_id: Uuid,
    pub code: String,
    /// Informational only; the stored expiry is authoritative.
    pub expires_at: DateTime<Utc>,
}

/// A freshly minted token plus the string a client renders as a QR image.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: QrToken,
    pub payload: String,
}

/// Why a presented QR payload was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrRejection {
    CodeMismatch,
    Expired,
    Malformed,
}

impl From<QrRejection> for AppError {
    fn from(r: QrRejection) -> Self {
        match r {
            QrRejection::CodeMismatch => AppError::CodeMismatch,
            QrRejection::Expired => AppError::Expired,
            QrRejection::Malformed => AppError::Malformed,
        }
    }
}

/// Renders the JSON string a client encodes into the QR image.
pub fn render_payload(session_id: Uuid, token: &QrToken) -> String {
    let payload = QrPayload {
        session_id,
        code: token.code.clone(),
        expires_at: token.expires_at,
    };
    // A struct of a UUID, a string and a timestamp always serializes.
    sonic_rs::to_string(&payload).unwrap_or_default()
}

/// Issues and validates session-bound QR tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct QrTokenService;

impl QrTokenService {
    /// Mints a token valid for `ttl_minutes` from `now`.
    ///
    /// A TTL whose expiry cannot be represented is a `Validation` error.
    pub fn issue(
        &self,
        session_id: Uuid,
        ttl_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, AppError> {
        let expires_at = Duration::try_minutes(ttl_minutes)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| AppError::Validation("QR token TTL is out of range".to_string()))?;
        let token = QrToken {
            code: token::generate_qr_token(),
            expires_at,
        };
        let payload = render_payload(session_id, &token);

        tracing::debug!("🔳 QR token issued for session {} (expires {})", session_id, token.expires_at);
        Ok(IssuedToken { token, payload })
    }

    /// Checks a presented payload against the session's current token.
    ///
    /// `session_id` is the session named by the request; the one embedded in
    /// the payload is only compared against it, never used for lookup.
    pub fn verify(
        &self,
        presented: &str,
        session_id: Uuid,
        expected: &QrToken,
        now: DateTime<Utc>,
    ) -> Result<(), QrRejection> {
        let payload: QrPayload =
            sonic_rs::from_str(presented.trim()).map_err(|_| QrRejection::Malformed)?;
        if payload.code.is_empty() {
            return Err(QrRejection::Malformed);
        }

        if !token::tokens_equal(&payload.code, &expected.code) {
            return Err(QrRejection::CodeMismatch);
        }
        if payload.session_id != session_id {
            tracing::warn!(
                "QR payload for session {} presented to session {}",
                payload.session_id,
                session_id
            );
            return Err(QrRejection::CodeMismatch);
        }

        if now > expected.expires_at {
            return Err(QrRejection::Expired);
        }

        Ok(())
    }
}
