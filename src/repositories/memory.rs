//! In-process implementations of the store traits.
//!
//! Same contracts as the Postgres stores, including the (session, member)
//! uniqueness of records. Used by the test-suite and by embedders that keep
//! their directory in memory.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::record::{AttendanceRecord, RecordFilter},
    repositories::{groups::GroupDirectory, identities::IdentityStore, records::RecordStore},
    services::face::Descriptor,
};

fn poisoned<T>(_: T) -> AppError {
    AppError::Internal("in-memory store lock poisoned".to_string())
}

#[derive(Default)]
pub struct MemoryGroupDirectory {
    owners: RwLock<HashMap<Uuid, Uuid>>,
    members: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl MemoryGroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&self, group_id: Uuid, owner_id: Uuid) {
        if let Ok(mut owners) = self.owners.write() {
            owners.insert(group_id, owner_id);
        }
    }

    pub fn enroll(&self, group_id: Uuid, member_id: Uuid) {
        if let Ok(mut members) = self.members.write() {
            members.entry(group_id).or_default().insert(member_id);
        }
    }
}

#[async_trait]
impl GroupDirectory for MemoryGroupDirectory {
    async fn is_member(&self, group_id: Uuid, member_id: Uuid) -> Result<bool> {
        let members = self.members.read().map_err(poisoned)?;
        Ok(members.get(&group_id).is_some_and(|m| m.contains(&member_id)))
    }

    async fn owner_of(&self, group_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.owners.read().map_err(poisoned)?.get(&group_id).copied())
    }
}

#[derive(Default)]
struct Identity {
    face_descriptor: Option<Descriptor>,
    nfc_tag: Option<String>,
}

#[derive(Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<HashMap<Uuid, Identity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, member_id: Uuid) {
        if let Ok(mut ids) = self.identities.write() {
            ids.entry(member_id).or_default();
        }
    }

    pub fn bind_tag(&self, member_id: Uuid, nfc_tag: impl Into<String>) {
        if let Ok(mut ids) = self.identities.write() {
            ids.entry(member_id).or_default().nfc_tag = Some(nfc_tag.into());
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn face_descriptor(&self, member_id: Uuid) -> Result<Option<Descriptor>> {
        let ids = self.identities.read().map_err(poisoned)?;
        Ok(ids.get(&member_id).and_then(|i| i.face_descriptor.clone()))
    }

    async fn set_face_descriptor(&self, member_id: Uuid, descriptor: Descriptor) -> Result<()> {
        let mut ids = self.identities.write().map_err(poisoned)?;
        let identity = ids.get_mut(&member_id).ok_or(AppError::NotFound)?;
        identity.face_descriptor = Some(descriptor);
        Ok(())
    }

    async fn find_by_tag(&self, nfc_tag: &str) -> Result<Option<Uuid>> {
        let ids = self.identities.read().map_err(poisoned)?;
        Ok(ids
            .iter()
            .find(|(_, identity)| identity.nfc_tag.as_deref() == Some(nfc_tag))
            .map(|(id, _)| *id))
    }
}

#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<AttendanceRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: &AttendanceRecord) -> Result<Uuid> {
        let mut records = self.records.write().map_err(poisoned)?;
        if records
            .iter()
            .any(|r| r.session_id == record.session_id && r.member_id == record.member_id)
        {
            return Err(AppError::StorageConflict);
        }
        records.push(record.clone());
        Ok(record.id)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<AttendanceRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut matching: Vec<_> = records.iter().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| b.marked_at.cmp(&a.marked_at));
        Ok(matching)
    }
}
