use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{
        record::{AttendanceRecord, RecordFilter},
        session::GeoPoint,
    },
};

/// Durable, write-once attendance records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persists a record. Fails with `StorageConflict` if the
    /// (session, member) pair already has one.
    async fn create(&self, record: &AttendanceRecord) -> Result<Uuid>;

    /// Records matching `filter`, newest first.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<AttendanceRecord>>;
}

/// Postgres-backed record store.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: Pool,
}

impl PgRecordStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// A helper function to map a `tokio_postgres::Row` to an `AttendanceRecord`.
fn row_to_record(row: &Row) -> Result<AttendanceRecord> {
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    Ok(AttendanceRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        group_id: row.try_get("group_id")?,
        member_id: row.try_get("member_id")?,
        method: row.try_get("method")?,
        status: row.try_get("status")?,
        marked_at: row.try_get("marked_at")?,
        geofence_checked: row.try_get("geofence_checked")?,
        location: latitude.zip(longitude).map(|(lat, lon)| GeoPoint::new(lat, lon)),
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create(&self, record: &AttendanceRecord) -> Result<Uuid> {
        let client = self.pool.get().await?;
        let latitude = record.location.map(|l| l.latitude);
        let longitude = record.location.map(|l| l.longitude);
        let row = client
            .query_one(
                r#"
                INSERT INTO attendance_records
                    (id, session_id, group_id, member_id, method, status,
                     marked_at, geofence_checked, latitude, longitude)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING id
                "#,
                &[
                    &record.id,
                    &record.session_id,
                    &record.group_id,
                    &record.member_id,
                    &record.method,
                    &record.status,
                    &record.marked_at,
                    &record.geofence_checked,
                    &latitude,
                    &longitude,
                ],
            )
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<AttendanceRecord>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT id, session_id, group_id, member_id, method, status,
                       marked_at, geofence_checked, latitude, longitude
                FROM attendance_records
                WHERE ($1::uuid IS NULL OR group_id = $1)
                  AND ($2::uuid IS NULL OR session_id = $2)
                  AND ($3::uuid IS NULL OR member_id = $3)
                  AND ($4::timestamptz IS NULL OR marked_at >= $4)
                  AND ($5::timestamptz IS NULL OR marked_at <= $5)
                ORDER BY marked_at DESC
                "#,
                &[
                    &filter.group_id,
                    &filter.session_id,
                    &filter.member_id,
                    &filter.from,
                    &filter.to,
                ],
            )
            .await?;
        rows.iter().map(row_to_record).collect()
    }
}
