//! Verification dispatcher: the single entry point for marking attendance.
//!
//! Every channel (face, QR, NFC) runs through the same pipeline: load the
//! session, check membership and duplicates, run the channel's verifier,
//! check the geofence, then commit the entry and its durable record and
//! notify observers. Store lookups run outside the session's lock; the
//! final state checks and the commit run under it, and nothing is
//! committed unless every check passed.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::AttendancePolicy,
    error::{AppError, Result},
    models::{
        event::SessionEvent,
        record::{AttendanceRecord, RecordFilter, RecordSummary},
        session::{AttendanceEntry, GeoPoint, GeofenceOutcome, MarkMethod, Session},
    },
    repositories::{groups::GroupDirectory, identities::IdentityStore, records::RecordStore},
    services::{
        events::{EventBus, EventStream},
        face::{Descriptor, FaceExtraction, FaceMatcher, validate_descriptor},
        geo,
        identity::IdentityResolver,
        qr::{IssuedToken, QrTokenService},
        sessions::{OpenSession, SessionGuard, SessionStore},
    },
};

/// Method-shaped proof of presence.
#[derive(Debug, Clone)]
pub enum Credential {
    /// A descriptor already extracted on the client.
    Face(Descriptor),
    /// A raw image to run through the extractor.
    FaceImage(Vec<u8>),
    /// The scanned QR payload.
    Qr(String),
    /// The tag identifier read from an NFC card.
    Nfc(String),
}

impl Credential {
    pub fn method(&self) -> MarkMethod {
        match self {
            Credential::Face(_) | Credential::FaceImage(_) => MarkMethod::Face,
            Credential::Qr(_) => MarkMethod::Qr,
            Credential::Nfc(_) => MarkMethod::Nfc,
        }
    }
}

/// A face sample submitted for registration.
#[derive(Debug, Clone)]
pub enum FaceSample {
    Descriptor(Descriptor),
    Image(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct MarkRequest {
    pub session_id: Uuid,
    pub requester: Uuid,
    pub credential: Credential,
    pub location: Option<GeoPoint>,
}

/// The external stores the dispatcher consults.
#[derive(Clone)]
pub struct Collaborators {
    pub groups: Arc<dyn GroupDirectory>,
    pub identities: Arc<dyn IdentityStore>,
    pub records: Arc<dyn RecordStore>,
}

pub struct AttendanceService {
    sessions: SessionStore,
    groups: Arc<dyn GroupDirectory>,
    identities: Arc<dyn IdentityStore>,
    records: Arc<dyn RecordStore>,
    resolver: IdentityResolver,
    qr: QrTokenService,
    faces: FaceMatcher,
    extraction: FaceExtraction,
    events: EventBus,
    clock: Arc<dyn Clock>,
    policy: AttendancePolicy,
}

impl AttendanceService {
    pub fn new(
        stores: Collaborators,
        extraction: FaceExtraction,
        clock: Arc<dyn Clock>,
        policy: AttendancePolicy,
    ) -> Self {
        let events = EventBus::new(policy.event_buffer);
        let sessions = SessionStore::new(
            stores.groups.clone(),
            events.clone(),
            clock.clone(),
            policy.storage_timeout,
        );
        Self {
            sessions,
            resolver: IdentityResolver::new(stores.identities.clone(), policy.storage_timeout),
            groups: stores.groups,
            identities: stores.identities,
            records: stores.records,
            qr: QrTokenService,
            faces: FaceMatcher::new(policy.face_match_threshold),
            extraction,
            events,
            clock,
            policy,
        }
    }

    fn timeout(&self) -> Duration {
        self.policy.storage_timeout
    }

    pub fn extraction(&self) -> &FaceExtraction {
        &self.extraction
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn open_session(&self, params: OpenSession) -> Result<(Session, Option<IssuedToken>)> {
        self.sessions.open(params).await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Session> {
        self.sessions.get(session_id).await
    }

    pub async fn close_session(&self, session_id: Uuid, authority_id: Uuid) -> Result<Session> {
        self.sessions.close(session_id, authority_id).await
    }

    pub async fn rotate_token(
        &self,
        session_id: Uuid,
        authority_id: Uuid,
        ttl_minutes: Option<i64>,
    ) -> Result<IssuedToken> {
        let ttl = ttl_minutes.unwrap_or(self.policy.qr_ttl_minutes);
        self.sessions.rotate_token(session_id, authority_id, ttl).await
    }

    /// Subscribes `observer` to a session's events. Only the authority and
    /// members of the session's group may observe.
    pub async fn subscribe(&self, session_id: Uuid, observer: Uuid) -> Result<EventStream> {
        let session = self.sessions.get(session_id).await?;
        if session.authority_id != observer {
            let member = tokio::time::timeout(
                self.timeout(),
                self.groups.is_member(session.group_id, observer),
            )
            .await??;
            if !member {
                return Err(AppError::NotAuthorized);
            }
        }
        self.sessions.subscribe(session_id).await
    }

    pub async fn sweep_overdue(&self) -> Vec<Uuid> {
        self.sessions.close_overdue().await
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active_count()
    }

    /// Marks attendance for the subject of `req`.
    ///
    /// For QR and face the subject is the requester. For NFC it is whoever
    /// the tag resolves to.
    ///
    /// Every check that needs an external store (tag, membership, stored
    /// face) runs before the session lock is taken. Under the lock the
    /// session state is re-checked, the QR token verified, and the entry
    /// committed, so the lock is held across at most one store call.
    pub async fn mark(&self, req: MarkRequest) -> Result<AttendanceEntry> {
        let used = req.credential.method();

        let snapshot = self.sessions.get(req.session_id).await?;
        if !snapshot.is_active() {
            return Err(AppError::SessionClosed);
        }
        if !snapshot.method.accepts(used) {
            return Err(AppError::MethodNotAllowed);
        }
        if let Some(location) = &req.location {
            location.ensure_valid()?;
        }

        let subject = match &req.credential {
            Credential::Nfc(tag) => self.resolver.resolve_by_tag(tag).await?,
            _ => req.requester,
        };

        let enrolled = tokio::time::timeout(
            self.timeout(),
            self.groups.is_member(snapshot.group_id, subject),
        )
        .await??;
        if !enrolled {
            return Err(AppError::NotEnrolled);
        }
        if snapshot.has_entry_for(subject) {
            return Err(AppError::AlreadyMarked);
        }

        match &req.credential {
            Credential::Face(descriptor) => {
                validate_descriptor(descriptor).map_err(|_| AppError::Malformed)?;
                self.verify_face(subject, descriptor).await?;
            }
            Credential::FaceImage(image) => {
                let captured = self.extraction.extract(image).await?;
                self.verify_face(subject, &captured).await?;
            }
            Credential::Qr(_) | Credential::Nfc(_) => {}
        }

        // The anchor is fixed at open, so the snapshot's copy is current.
        let geofence = self.check_geofence(snapshot.geofence, req.location)?;

        let mut guard = self.sessions.lock(req.session_id).await?;
        if !guard.session().is_active() {
            return Err(AppError::SessionClosed);
        }
        if guard.session().has_entry_for(subject) {
            return Err(AppError::AlreadyMarked);
        }
        if let Credential::Qr(presented) = &req.credential {
            let current = guard.session().qr_token.as_ref().ok_or(AppError::CodeMismatch)?;
            self.qr
                .verify(presented, req.session_id, current, self.clock.now())?;
        }

        let entry = AttendanceEntry {
            member_id: subject,
            marked_at: self.clock.now(),
            method: used,
            geofence,
            location: req.location,
        };
        self.commit(&mut guard, entry.clone()).await?;

        tracing::info!(
            "✅ {} marked present in session {} via {:?}",
            subject,
            req.session_id,
            used
        );
        Ok(entry)
    }

    async fn verify_face(&self, member_id: Uuid, captured: &[f32]) -> Result<()> {
        let stored =
            tokio::time::timeout(self.timeout(), self.identities.face_descriptor(member_id))
                .await??
                .ok_or(AppError::FaceNotRegistered)?;

        if !self.faces.verify(Some(captured), Some(&stored)) {
            tracing::warn!("❌ Face verification failed for {}", member_id);
            return Err(AppError::VerificationFailed);
        }
        Ok(())
    }

    fn check_geofence(
        &self,
        anchor: Option<GeoPoint>,
        location: Option<GeoPoint>,
    ) -> Result<GeofenceOutcome> {
        let (Some(anchor), Some(location)) = (anchor, location) else {
            return Ok(GeofenceOutcome::Skipped);
        };

        let distance_meters = geo::distance_between(anchor, location);
        if distance_meters.is_nan() || distance_meters > self.policy.geofence_radius_meters {
            tracing::warn!("📍 Location {:.0} m from session anchor", distance_meters);
            return Err(AppError::LocationMismatch { distance_meters });
        }
        Ok(GeofenceOutcome::Passed { distance_meters })
    }

    /// Appends the entry, persists its record, and notifies observers.
    /// A failed persist retracts the entry.
    async fn commit(&self, guard: &mut SessionGuard, entry: AttendanceEntry) -> Result<()> {
        let (session_id, group_id) = (guard.session().id, guard.session().group_id);
        let record = AttendanceRecord::present(session_id, group_id, &entry);

        guard.append_entry(entry.clone())?;

        let persisted = tokio::time::timeout(self.timeout(), self.records.create(&record))
            .await
            .map_err(AppError::from)
            .and_then(|r| r);
        if let Err(e) = persisted {
            tracing::error!("❌ Record for {} in session {} not written: {}", entry.member_id, session_id, e);
            guard.retract_entry(entry.member_id);
            return Err(e);
        }

        self.events.publish(SessionEvent::AttendanceMarked {
            session_id,
            member_id: entry.member_id,
            method: entry.method,
            timestamp: entry.marked_at,
            count: guard.session().attendance.len(),
        });
        Ok(())
    }

    /// Stores a member's face descriptor, extracting it first if an image
    /// was submitted.
    pub async fn register_face(&self, member_id: Uuid, sample: FaceSample) -> Result<()> {
        let descriptor = match sample {
            FaceSample::Descriptor(d) => {
                validate_descriptor(&d)?;
                d
            }
            FaceSample::Image(image) => self.extraction.extract(&image).await?,
        };

        tokio::time::timeout(
            self.timeout(),
            self.identities.set_face_descriptor(member_id, descriptor),
        )
        .await??;
        tracing::info!("🙂 Face registered for {}", member_id);
        Ok(())
    }

    /// Lists durable records. Members may list their own; anything else
    /// requires owning the filtered group.
    pub async fn list_records(&self, caller: Uuid, filter: RecordFilter) -> Result<Vec<AttendanceRecord>> {
        if filter.member_id != Some(caller) {
            let group_id = filter.group_id.ok_or(AppError::NotAuthorized)?;
            let owner = tokio::time::timeout(self.timeout(), self.groups.owner_of(group_id))
                .await??
                .ok_or(AppError::NotFound)?;
            if owner != caller {
                return Err(AppError::NotAuthorized);
            }
        }

        Ok(tokio::time::timeout(self.timeout(), self.records.list(&filter)).await??)
    }

    /// Counts records by status, channel and member. Same access rules as
    /// `list_records`.
    pub async fn summarize_records(&self, caller: Uuid, filter: RecordFilter) -> Result<RecordSummary> {
        let records = self.list_records(caller, filter).await?;
        Ok(RecordSummary::from_records(&records))
    }
}
