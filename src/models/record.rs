use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::models::session::{AttendanceEntry, GeoPoint, MarkMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "attendance_status", rename_all = "snake_case")]
pub enum RecordStatus {
    Present,
    Absent,
    Late,
}

/// Durable projection of an entry. Written once, never updated, and
/// independent of the session it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub group_id: Uuid,
    pub member_id: Uuid,
    pub method: MarkMethod,
    pub status: RecordStatus,
    pub marked_at: DateTime<Utc>,
    pub geofence_checked: bool,
    pub location: Option<GeoPoint>,
}

impl AttendanceRecord {
    pub fn present(session_id: Uuid, group_id: Uuid, entry: &AttendanceEntry) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            group_id,
            member_id: entry.member_id,
            method: entry.method,
            status: RecordStatus::Present,
            marked_at: entry.marked_at,
            geofence_checked: entry.geofence.was_checked(),
            location: entry.location,
        }
    }
}

/// Query over durable records. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub group_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub member_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        self.group_id.is_none_or(|g| g == record.group_id)
            && self.session_id.is_none_or(|s| s == record.session_id)
            && self.member_id.is_none_or(|m| m == record.member_id)
            && self.from.is_none_or(|f| record.marked_at >= f)
            && self.to.is_none_or(|t| record.marked_at <= t)
    }
}

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub present: usize,
    pub absent: usize,
    pub late: usize,
}

impl StatusCounts {
    fn add(&mut self, status: RecordStatus) {
        match status {
            RecordStatus::Present => self.present += 1,
            RecordStatus::Absent => self.absent += 1,
            RecordStatus::Late => self.late += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.present + self.absent + self.late
    }
}

/// Record counts per verifying channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MethodCounts {
    pub face: usize,
    pub qr: usize,
    pub nfc: usize,
}

impl MethodCounts {
    fn add(&mut self, method: MarkMethod) {
        match method {
            MarkMethod::Face => self.face += 1,
            MarkMethod::Qr => self.qr += 1,
            MarkMethod::Nfc => self.nfc += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberTally {
    pub member_id: Uuid,
    pub counts: StatusCounts,
}

/// Aggregate view over a set of records: how many, through which channel,
/// and per member. Members are ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub total_records: usize,
    pub sessions: usize,
    pub status: StatusCounts,
    pub methods: MethodCounts,
    pub members: Vec<MemberTally>,
}

impl RecordSummary {
    pub fn from_records(records: &[AttendanceRecord]) -> Self {
        let mut summary = Self {
            total_records: records.len(),
            ..Default::default()
        };
        let mut sessions = HashSet::new();
        let mut members: BTreeMap<Uuid, StatusCounts> = BTreeMap::new();

        for record in records {
            sessions.insert(record.session_id);
            summary.status.add(record.status);
            summary.methods.add(record.method);
            members.entry(record.member_id).or_default().add(record.status);
        }

        summary.sessions = sessions.len();
        summary.members = members
            .into_iter()
            .map(|(member_id, counts)| MemberTally { member_id, counts })
            .collect();
        summary
    }
}
