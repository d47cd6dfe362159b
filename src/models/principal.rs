use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The authenticated caller, as written to Redis by the auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// The ID of the user this principal belongs to.
    pub user_id: Uuid,
    /// The timestamp when the login was created.
    pub created_at: DateTime<Utc>,
    /// The timestamp when the login expires.
    pub expires_at: DateTime<Utc>,
}
