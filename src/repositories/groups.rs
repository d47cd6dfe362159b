use async_trait::async_trait;
use deadpool_postgres::Pool;
use uuid::Uuid;

use crate::error::Result;

/// Lookup interface over groups and their membership.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Whether `member_id` is a participant of `group_id`.
    async fn is_member(&self, group_id: Uuid, member_id: Uuid) -> Result<bool>;

    /// The authority that owns `group_id`, or `None` if the group is unknown.
    async fn owner_of(&self, group_id: Uuid) -> Result<Option<Uuid>>;
}

/// Postgres-backed group directory.
#[derive(Clone)]
pub struct PgGroupDirectory {
    pool: Pool,
}

impl PgGroupDirectory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GroupDirectory for PgGroupDirectory {
    async fn is_member(&self, group_id: Uuid, member_id: Uuid) -> Result<bool> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM group_members
                    WHERE group_id = $1 AND member_id = $2
                )
                "#,
            )
            .await?;
        let row = client.query_one(&stmt, &[&group_id, &member_id]).await?;
        Ok(row.try_get(0)?)
    }

    async fn owner_of(&self, group_id: Uuid) -> Result<Option<Uuid>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached("SELECT owner_id FROM groups WHERE id = $1")
            .await?;
        let row = client.query_opt(&stmt, &[&group_id]).await?;
        row.map(|r| r.try_get("owner_id")).transpose().map_err(Into::into)
    }
}
