use async_trait::async_trait;
use deadpool_postgres::Pool;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    services::face::Descriptor,
};

/// Member identity attributes used for verification.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// The member's stored face descriptor. Absent when none was registered
    /// or the member has no identity row.
    async fn face_descriptor(&self, member_id: Uuid) -> Result<Option<Descriptor>>;

    /// Stores (or replaces) a member's face descriptor.
    async fn set_face_descriptor(&self, member_id: Uuid, descriptor: Descriptor) -> Result<()>;

    /// The member bound to an NFC tag, if any.
    async fn find_by_tag(&self, nfc_tag: &str) -> Result<Option<Uuid>>;
}

/// Postgres-backed identity store.
#[derive(Clone)]
pub struct PgIdentityStore {
    pool: Pool,
}

impl PgIdentityStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn face_descriptor(&self, member_id: Uuid) -> Result<Option<Descriptor>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT face_descriptor FROM members WHERE id = $1",
                &[&member_id],
            )
            .await?;
        match row {
            Some(row) => Ok(row.try_get("face_descriptor")?),
            None => Ok(None),
        }
    }

    async fn set_face_descriptor(&self, member_id: Uuid, descriptor: Descriptor) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE members
                SET face_descriptor = $1, updated_at = NOW()
                WHERE id = $2
                "#,
                &[&descriptor, &member_id],
            )
            .await?;
        if updated == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn find_by_tag(&self, nfc_tag: &str) -> Result<Option<Uuid>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT id FROM members WHERE nfc_tag = $1", &[&nfc_tag])
            .await?;
        row.map(|r| r.try_get("id")).transpose().map_err(Into::into)
    }
}
