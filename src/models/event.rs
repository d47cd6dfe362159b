use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::session::MarkMethod;

/// Live notification delivered to a session's observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    AttendanceMarked {
        session_id: Uuid,
        member_id: Uuid,
        method: MarkMethod,
        timestamp: DateTime<Utc>,
        count: usize,
    },
    TokenRotated {
        session_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    SessionClosed {
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        attendee_count: usize,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::AttendanceMarked { session_id, .. }
            | SessionEvent::TokenRotated { session_id, .. }
            | SessionEvent::SessionClosed { session_id, .. } => *session_id,
        }
    }
}
