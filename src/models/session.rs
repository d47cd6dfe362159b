use chrono::{DateTime, Duration, Utc};
use garde::Validate;
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How members of a session prove presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Face,
    Qr,
    Nfc,
    /// Any of the above.
    Hybrid,
}

impl VerificationMethod {
    /// Whether sessions with this method carry a QR token.
    pub fn issues_qr(self) -> bool {
        matches!(self, VerificationMethod::Qr | VerificationMethod::Hybrid)
    }

    /// Whether a credential of kind `used` is accepted.
    pub fn accepts(self, used: MarkMethod) -> bool {
        match self {
            VerificationMethod::Hybrid => true,
            VerificationMethod::Face => used == MarkMethod::Face,
            VerificationMethod::Qr => used == MarkMethod::Qr,
            VerificationMethod::Nfc => used == MarkMethod::Nfc,
        }
    }
}

/// The channel that actually verified one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "mark_method", rename_all = "snake_case")]
pub enum MarkMethod {
    Face,
    Qr,
    Nfc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct GeoPoint {
    #[garde(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[garde(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Rejects coordinates outside the globe, NaN and infinities included.
    pub fn ensure_valid(&self) -> crate::error::Result<()> {
        // NaN fails every comparison, so `contains` is false for it.
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(crate::error::AppError::Validation(format!(
                "Invalid coordinates ({}, {})",
                self.latitude, self.longitude
            )));
        }
        Ok(())
    }
}

/// The session's current QR token. Re-issuing replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrToken {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of the geofence step for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GeofenceOutcome {
    /// The session has no anchor or the request carried no location.
    Skipped,
    Passed { distance_meters: f64 },
}

impl GeofenceOutcome {
    pub fn was_checked(&self) -> bool {
        matches!(self, GeofenceOutcome::Passed { .. })
    }
}

/// One committed proof of presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEntry {
    pub member_id: Uuid,
    pub marked_at: DateTime<Utc>,
    pub method: MarkMethod,
    pub geofence: GeofenceOutcome,
    pub location: Option<GeoPoint>,
}

/// A bounded-time attendance window for one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub group_id: Uuid,
    pub authority_id: Uuid,
    pub method: VerificationMethod,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: i64,
    pub geofence: Option<GeoPoint>,
    pub qr_token: Option<QrToken>,
    pub attendance: Vec<AttendanceEntry>,
}

impl Session {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// When the planned window ends, if that instant is representable.
    pub fn planned_end(&self) -> Option<DateTime<Utc>> {
        Duration::try_minutes(self.duration_minutes)
            .and_then(|d| self.started_at.checked_add_signed(d))
    }

    pub fn has_entry_for(&self, member_id: Uuid) -> bool {
        self.attendance.iter().any(|e| e.member_id == member_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_accepts_every_channel() {
        for used in [MarkMethod::Face, MarkMethod::Qr, MarkMethod::Nfc] {
            assert!(VerificationMethod::Hybrid.accepts(used));
        }
        assert!(!VerificationMethod::Face.accepts(MarkMethod::Qr));
        assert!(!VerificationMethod::Nfc.accepts(MarkMethod::Face));
    }

    #[test]
    fn only_qr_and_hybrid_issue_tokens() {
        assert!(VerificationMethod::Qr.issues_qr());
        assert!(VerificationMethod::Hybrid.issues_qr());
        assert!(!VerificationMethod::Face.issues_qr());
        assert!(!VerificationMethod::Nfc.issues_qr());
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        assert!(GeoPoint::new(91.0, 0.0).validate().is_err());
        assert!(GeoPoint::new(0.0, -181.0).validate().is_err());
        assert!(GeoPoint::new(-33.9, 18.4).validate().is_ok());
    }

    #[test]
    fn non_finite_coordinates_are_invalid() {
        assert!(GeoPoint::new(f64::NAN, 0.0).ensure_valid().is_err());
        assert!(GeoPoint::new(0.0, f64::INFINITY).ensure_valid().is_err());
        assert!(GeoPoint::new(91.0, 0.0).ensure_valid().is_err());
        assert!(GeoPoint::new(-33.9, 18.4).ensure_valid().is_ok());
        assert!(GeoPoint::new(90.0, -180.0).ensure_valid().is_ok());
    }

    #[test]
    fn planned_end_is_none_when_unrepresentable() {
        let session = Session {
            id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            authority_id: Uuid::new_v4(),
            method: VerificationMethod::Face,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            duration_minutes: i64::MAX,
            geofence: None,
            qr_token: None,
            attendance: Vec::new(),
        };
        assert!(session.planned_end().is_none());

        let session = Session { duration_minutes: 15, ..session };
        assert_eq!(
            session.planned_end(),
            Some(session.started_at + Duration::minutes(15))
        );
    }
}
