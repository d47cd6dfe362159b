use deadpool_postgres::Pool;
use redis::aio::ConnectionManager;
use std::sync::Arc;

use crate::clock::SystemClock;
use crate::config::Config;
use crate::error::Result;
use crate::repositories::{
    groups::PgGroupDirectory, identities::PgIdentityStore, records::PgRecordStore,
};
use crate::services::attendance::{AttendanceService, Collaborators};
use crate::services::face::FaceExtraction;

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The database connection pool.
    pub db: Pool,
    /// The Redis connection manager.
    pub redis: ConnectionManager,
    /// The application's configuration.
    pub config: Config,
    /// Session orchestration and verification.
    pub attendance: Arc<AttendanceService>,
}

impl AppState {
    /// Creates a new `AppState`.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    /// * `extraction` - The face extractor handle; `FaceExtraction::disabled()`
    ///   when no model is deployed.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState`.
    pub async fn new(config: &Config, extraction: FaceExtraction) -> Result<Self> {
        let db = crate::db::create_pool(&config.database_url, config.policy.storage_timeout)?;
        tracing::info!("✅ PostgreSQL Pool initialized with deadpool-postgres");

        let redis_client = redis::Client::open(config.redis_url.as_str())?;
        let redis = ConnectionManager::new(redis_client).await?;
        tracing::info!("✅ Redis Connection Manager initialized (pooled)");

        let stores = Collaborators {
            groups: Arc::new(PgGroupDirectory::new(db.clone())),
            identities: Arc::new(PgIdentityStore::new(db.clone())),
            records: Arc::new(PgRecordStore::new(db.clone())),
        };
        let attendance = Arc::new(AttendanceService::new(
            stores,
            extraction,
            Arc::new(SystemClock),
            config.policy.clone(),
        ));
        tracing::info!(
            "✅ Attendance service initialized (geofence {} m, face threshold {})",
            config.policy.geofence_radius_meters,
            config.policy.face_match_threshold
        );

        Ok(AppState {
            db,
            redis,
            config: config.clone(),
            attendance,
        })
    }
}
