use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    repositories::identities::IdentityStore,
};

/// Resolves presented NFC tags to member identities.
///
/// Resolution trusts the physical tag alone: whoever holds the tag is marked,
/// regardless of who submitted the request.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    timeout: Duration,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn resolve_by_tag(&self, nfc_tag: &str) -> Result<Uuid> {
        let tag = nfc_tag.trim();
        if tag.is_empty() {
            return Err(AppError::Malformed);
        }
        tokio::time::timeout(self.timeout, self.store.find_by_tag(tag))
            .await??
            .ok_or(AppError::UnknownTag)
    }
}
