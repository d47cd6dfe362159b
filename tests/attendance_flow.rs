use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::StreamExt;
use uuid::Uuid;

use rollcall::{
    clock::{Clock, ManualClock},
    config::AttendancePolicy,
    error::{AppError, Result},
    models::{
        event::SessionEvent,
        record::{AttendanceRecord, RecordFilter, RecordStatus},
        session::{
            GeoPoint, GeofenceOutcome, MarkMethod, Session, SessionStatus, VerificationMethod,
        },
    },
    repositories::{
        groups::GroupDirectory,
        memory::{MemoryGroupDirectory, MemoryIdentityStore, MemoryRecordStore},
        records::RecordStore,
    },
    services::{
        attendance::{AttendanceService, Collaborators, Credential, FaceSample, MarkRequest},
        face::{DESCRIPTOR_LEN, Descriptor, FaceExtraction, FaceExtractor},
        qr::IssuedToken,
        sessions::OpenSession,
    },
};

/// Returns a fixed descriptor for any non-empty image.
struct FixedExtractor;

#[async_trait]
impl FaceExtractor for FixedExtractor {
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn extract(&self, image: &[u8]) -> Result<Descriptor> {
        if image.is_empty() {
            return Err(AppError::NoFaceDetected);
        }
        Ok(vec![0.1; DESCRIPTOR_LEN])
    }
}

/// Counts extraction calls and returns a fixed descriptor.
#[derive(Default)]
struct CountingExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl FaceExtractor for CountingExtractor {
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn extract(&self, _image: &[u8]) -> Result<Descriptor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0.1; DESCRIPTOR_LEN])
    }
}

/// Answers membership questions only after a fixed delay.
struct SlowGroupDirectory {
    inner: Arc<dyn GroupDirectory>,
    delay: StdDuration,
}

#[async_trait]
impl GroupDirectory for SlowGroupDirectory {
    async fn is_member(&self, group_id: Uuid, member_id: Uuid) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.is_member(group_id, member_id).await
    }

    async fn owner_of(&self, group_id: Uuid) -> Result<Option<Uuid>> {
        self.inner.owner_of(group_id).await
    }
}

/// Writes records only after a fixed delay.
struct SlowRecordStore {
    inner: Arc<dyn RecordStore>,
    delay: StdDuration,
}

#[async_trait]
impl RecordStore for SlowRecordStore {
    async fn create(&self, record: &AttendanceRecord) -> Result<Uuid> {
        tokio::time::sleep(self.delay).await;
        self.inner.create(record).await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<AttendanceRecord>> {
        self.inner.list(filter).await
    }
}

// Shared test context
struct TestContext {
    clock: Arc<ManualClock>,
    groups: Arc<MemoryGroupDirectory>,
    identities: Arc<MemoryIdentityStore>,
    records: Arc<MemoryRecordStore>,
    service: Arc<AttendanceService>,
    group_id: Uuid,
    authority: Uuid,
}

impl TestContext {
    fn new() -> Self {
        Self::with_extraction(FaceExtraction::disabled())
    }

    fn with_extraction(extraction: FaceExtraction) -> Self {
        Self::assemble(extraction, AttendancePolicy::default(), |stores| stores)
    }

    /// Builds a context whose service sees the stores through `wrap`.
    fn assemble(
        extraction: FaceExtraction,
        policy: AttendancePolicy,
        wrap: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let groups = Arc::new(MemoryGroupDirectory::new());
        let identities = Arc::new(MemoryIdentityStore::new());
        let records = Arc::new(MemoryRecordStore::new());

        let group_id = Uuid::new_v4();
        let authority = Uuid::new_v4();
        groups.add_group(group_id, authority);
        identities.add_member(authority);

        let service = Arc::new(AttendanceService::new(
            wrap(Collaborators {
                groups: groups.clone(),
                identities: identities.clone(),
                records: records.clone(),
            }),
            extraction,
            clock.clone(),
            policy,
        ));

        Self {
            clock,
            groups,
            identities,
            records,
            service,
            group_id,
            authority,
        }
    }

    fn enrolled_member(&self) -> Uuid {
        let member = Uuid::new_v4();
        self.identities.add_member(member);
        self.groups.enroll(self.group_id, member);
        member
    }

    async fn open(
        &self,
        method: VerificationMethod,
        duration_minutes: i64,
        geofence: Option<GeoPoint>,
    ) -> (Session, Option<IssuedToken>) {
        self.service
            .open_session(OpenSession {
                group_id: self.group_id,
                authority_id: self.authority,
                method,
                duration_minutes,
                geofence,
            })
            .await
            .unwrap()
    }

    async fn mark(
        &self,
        session_id: Uuid,
        requester: Uuid,
        credential: Credential,
        location: Option<GeoPoint>,
    ) -> Result<rollcall::models::session::AttendanceEntry> {
        self.service
            .mark(MarkRequest {
                session_id,
                requester,
                credential,
                location,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn qr_mark_then_duplicate_then_expired() {
        let ctx = TestContext::new();
        let m1 = ctx.enrolled_member();
        let m2 = ctx.enrolled_member();

        let (session, issued) = ctx.open(VerificationMethod::Qr, 15, None).await;
        let t1 = issued.expect("qr sessions issue a token").payload;

        let entry = ctx
            .mark(session.id, m1, Credential::Qr(t1.clone()), None)
            .await
            .unwrap();
        assert_eq!(entry.member_id, m1);
        assert_eq!(entry.method, MarkMethod::Qr);
        assert_eq!(ctx.service.get_session(session.id).await.unwrap().attendance.len(), 1);

        let again = ctx.mark(session.id, m1, Credential::Qr(t1.clone()), None).await;
        assert!(matches!(again, Err(AppError::AlreadyMarked)));

        ctx.clock.advance(Duration::minutes(16));
        let stale = ctx.mark(session.id, m2, Credential::Qr(t1), None).await;
        assert!(matches!(stale, Err(AppError::Expired)));

        let session = ctx.service.get_session(session.id).await.unwrap();
        assert_eq!(session.attendance.len(), 1);
        assert_eq!(ctx.records.len(), 1);
    }

    #[tokio::test]
    async fn geofence_rejects_far_and_accepts_near() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        let anchor = GeoPoint::new(0.0, 0.0);

        let (session, issued) = ctx.open(VerificationMethod::Qr, 30, Some(anchor)).await;
        let token = issued.unwrap().payload;

        let far = ctx
            .mark(
                session.id,
                member,
                Credential::Qr(token.clone()),
                Some(GeoPoint::new(0.0, 0.01)),
            )
            .await;
        match far {
            Err(AppError::LocationMismatch { distance_meters }) => {
                assert!((distance_meters - 1112.0).abs() < 15.0);
            }
            other => panic!("expected LocationMismatch, got {:?}", other),
        }
        assert!(ctx.records.is_empty());

        let near = ctx
            .mark(
                session.id,
                member,
                Credential::Qr(token),
                Some(GeoPoint::new(0.0, 0.0001)),
            )
            .await
            .unwrap();
        assert!(near.geofence.was_checked());
        match near.geofence {
            GeofenceOutcome::Passed { distance_meters } => assert!(distance_meters < 100.0),
            GeofenceOutcome::Skipped => panic!("geofence should have been checked"),
        }
    }

    #[tokio::test]
    async fn missing_location_skips_the_geofence() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        let (session, issued) = ctx
            .open(VerificationMethod::Qr, 30, Some(GeoPoint::new(0.0, 0.0)))
            .await;

        let entry = ctx
            .mark(session.id, member, Credential::Qr(issued.unwrap().payload), None)
            .await
            .unwrap();
        assert_eq!(entry.geofence, GeofenceOutcome::Skipped);
    }

    #[tokio::test]
    async fn closed_session_refuses_otherwise_valid_marks() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        let (session, issued) = ctx.open(VerificationMethod::Qr, 15, None).await;

        let closed = ctx.service.close_session(session.id, ctx.authority).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Completed);
        assert!(closed.ended_at.is_some());
        assert!(closed.qr_token.is_none());

        let result = ctx
            .mark(session.id, member, Credential::Qr(issued.unwrap().payload), None)
            .await;
        assert!(matches!(result, Err(AppError::SessionClosed)));
    }

    #[tokio::test]
    async fn only_the_authority_may_close() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        let (session, _) = ctx.open(VerificationMethod::Nfc, 15, None).await;

        let result = ctx.service.close_session(session.id, member).await;
        assert!(matches!(result, Err(AppError::NotAuthorized)));
        assert!(ctx.service.get_session(session.id).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn opening_for_someone_elses_group_is_refused() {
        let ctx = TestContext::new();
        let outsider = Uuid::new_v4();

        let result = ctx
            .service
            .open_session(OpenSession {
                group_id: ctx.group_id,
                authority_id: outsider,
                method: VerificationMethod::Qr,
                duration_minutes: 15,
                geofence: None,
            })
            .await;
        assert!(matches!(result, Err(AppError::NotAuthorized)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_marks_yield_exactly_one_entry() {
        const ATTEMPTS: usize = 16;

        let ctx = Arc::new(TestContext::new());
        let member = ctx.enrolled_member();
        let (session, issued) = ctx.open(VerificationMethod::Qr, 15, None).await;
        let token = issued.unwrap().payload;

        let mut handles = Vec::with_capacity(ATTEMPTS);
        for _ in 0..ATTEMPTS {
            let ctx = ctx.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                ctx.mark(session.id, member, Credential::Qr(token), None).await
            }));
        }

        let mut successes = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(AppError::AlreadyMarked) => duplicates += 1,
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(duplicates, ATTEMPTS - 1);
        assert_eq!(ctx.service.get_session(session.id).await.unwrap().attendance.len(), 1);
        assert_eq!(ctx.records.len(), 1);
    }

    #[tokio::test]
    async fn nfc_marks_the_tag_holder() {
        let ctx = TestContext::new();
        let holder = ctx.enrolled_member();
        ctx.identities.bind_tag(holder, "04:A2:19:7F");

        let stranger = Uuid::new_v4();
        ctx.identities.add_member(stranger);
        ctx.identities.bind_tag(stranger, "04:FF:00:01");

        let (session, issued) = ctx.open(VerificationMethod::Nfc, 15, None).await;
        assert!(issued.is_none());

        let entry = ctx
            .mark(session.id, ctx.authority, Credential::Nfc("04:A2:19:7F".into()), None)
            .await
            .unwrap();
        assert_eq!(entry.member_id, holder);
        assert_eq!(entry.method, MarkMethod::Nfc);

        let unknown = ctx
            .mark(session.id, ctx.authority, Credential::Nfc("DE:AD".into()), None)
            .await;
        assert!(matches!(unknown, Err(AppError::UnknownTag)));

        let not_enrolled = ctx
            .mark(session.id, ctx.authority, Credential::Nfc("04:FF:00:01".into()), None)
            .await;
        assert!(matches!(not_enrolled, Err(AppError::NotEnrolled)));
    }

    #[tokio::test]
    async fn credential_must_fit_the_session_method() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        ctx.identities.bind_tag(member, "04:01");

        let (qr_session, _) = ctx.open(VerificationMethod::Qr, 15, None).await;
        let result = ctx
            .mark(qr_session.id, member, Credential::Nfc("04:01".into()), None)
            .await;
        assert!(matches!(result, Err(AppError::MethodNotAllowed)));

        let (hybrid, _) = ctx.open(VerificationMethod::Hybrid, 15, None).await;
        let entry = ctx
            .mark(hybrid.id, member, Credential::Nfc("04:01".into()), None)
            .await
            .unwrap();
        assert_eq!(entry.method, MarkMethod::Nfc);
    }

    #[tokio::test]
    async fn non_members_are_not_enrolled() {
        let ctx = TestContext::new();
        let outsider = Uuid::new_v4();
        ctx.identities.add_member(outsider);
        let (session, issued) = ctx.open(VerificationMethod::Qr, 15, None).await;

        let result = ctx
            .mark(session.id, outsider, Credential::Qr(issued.unwrap().payload), None)
            .await;
        assert!(matches!(result, Err(AppError::NotEnrolled)));
    }

    #[tokio::test]
    async fn face_flow() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        let (session, _) = ctx.open(VerificationMethod::Face, 15, None).await;

        let unregistered = ctx
            .mark(session.id, member, Credential::Face(vec![0.0; DESCRIPTOR_LEN]), None)
            .await;
        assert!(matches!(unregistered, Err(AppError::FaceNotRegistered)));

        ctx.service
            .register_face(member, FaceSample::Descriptor(vec![0.0; DESCRIPTOR_LEN]))
            .await
            .unwrap();

        let stranger = ctx
            .mark(session.id, member, Credential::Face(vec![1.0; DESCRIPTOR_LEN]), None)
            .await;
        assert!(matches!(stranger, Err(AppError::VerificationFailed)));

        let entry = ctx
            .mark(session.id, member, Credential::Face(vec![0.01; DESCRIPTOR_LEN]), None)
            .await
            .unwrap();
        assert_eq!(entry.method, MarkMethod::Face);
    }

    #[tokio::test]
    async fn face_images_need_a_ready_extractor() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        let (session, _) = ctx.open(VerificationMethod::Face, 15, None).await;

        let result = ctx
            .mark(session.id, member, Credential::FaceImage(vec![1, 2, 3]), None)
            .await;
        assert!(matches!(result, Err(AppError::ExtractorNotReady)));

        let registration = ctx
            .service
            .register_face(member, FaceSample::Image(vec![1, 2, 3]))
            .await;
        assert!(matches!(registration, Err(AppError::ExtractorNotReady)));
    }

    #[tokio::test]
    async fn face_images_are_extracted_and_matched() {
        let extraction = FaceExtraction::new(Arc::new(FixedExtractor));
        extraction.initialize().await.unwrap();
        let ctx = TestContext::with_extraction(extraction);
        let member = ctx.enrolled_member();

        ctx.service
            .register_face(member, FaceSample::Image(vec![0xff, 0xd8]))
            .await
            .unwrap();

        let (session, _) = ctx.open(VerificationMethod::Face, 15, None).await;

        let blank = ctx
            .mark(session.id, member, Credential::FaceImage(Vec::new()), None)
            .await;
        assert!(matches!(blank, Err(AppError::NoFaceDetected)));

        let entry = ctx
            .mark(session.id, member, Credential::FaceImage(vec![0xff, 0xd8]), None)
            .await
            .unwrap();
        assert_eq!(entry.member_id, member);
    }

    #[tokio::test]
    async fn observers_see_marks_and_the_stream_ends_on_close() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        let (session, issued) = ctx.open(VerificationMethod::Qr, 15, None).await;

        let mut events = ctx.service.subscribe(session.id, ctx.authority).await.unwrap();

        ctx.mark(session.id, member, Credential::Qr(issued.unwrap().payload), None)
            .await
            .unwrap();
        ctx.service.close_session(session.id, ctx.authority).await.unwrap();

        let wait = StdDuration::from_secs(1);
        match tokio::time::timeout(wait, events.next()).await.unwrap() {
            Some(SessionEvent::AttendanceMarked { member_id, count, .. }) => {
                assert_eq!(member_id, member);
                assert_eq!(count, 1);
            }
            other => panic!("expected AttendanceMarked, got {:?}", other),
        }
        match tokio::time::timeout(wait, events.next()).await.unwrap() {
            Some(SessionEvent::SessionClosed { attendee_count, .. }) => {
                assert_eq!(attendee_count, 1);
            }
            other => panic!("expected SessionClosed, got {:?}", other),
        }
        assert!(tokio::time::timeout(wait, events.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn outsiders_may_not_observe() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        let (session, _) = ctx.open(VerificationMethod::Qr, 15, None).await;

        assert!(ctx.service.subscribe(session.id, member).await.is_ok());
        let result = ctx.service.subscribe(session.id, Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::NotAuthorized)));
    }

    #[tokio::test]
    async fn rotation_invalidates_the_previous_token() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        let (session, issued) = ctx.open(VerificationMethod::Qr, 60, None).await;
        let old = issued.unwrap().payload;

        let fresh = ctx
            .service
            .rotate_token(session.id, ctx.authority, Some(5))
            .await
            .unwrap();
        assert_eq!(fresh.token.expires_at, ctx.clock.now() + Duration::minutes(5));

        let stale = ctx.mark(session.id, member, Credential::Qr(old), None).await;
        assert!(matches!(stale, Err(AppError::CodeMismatch)));

        ctx.mark(session.id, member, Credential::Qr(fresh.payload), None)
            .await
            .unwrap();

        let (nfc, _) = ctx.open(VerificationMethod::Nfc, 15, None).await;
        let result = ctx.service.rotate_token(nfc.id, ctx.authority, None).await;
        assert!(matches!(result, Err(AppError::MethodNotAllowed)));
    }

    #[tokio::test]
    async fn storage_conflict_leaves_no_entry_behind() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        let (session, issued) = ctx.open(VerificationMethod::Qr, 15, None).await;

        ctx.records
            .create(&AttendanceRecord {
                id: Uuid::new_v4(),
                session_id: session.id,
                group_id: ctx.group_id,
                member_id: member,
                method: MarkMethod::Qr,
                status: RecordStatus::Present,
                marked_at: ctx.clock.now(),
                geofence_checked: false,
                location: None,
            })
            .await
            .unwrap();

        let result = ctx
            .mark(session.id, member, Credential::Qr(issued.unwrap().payload), None)
            .await;
        assert!(matches!(result, Err(AppError::StorageConflict)));

        let session = ctx.service.get_session(session.id).await.unwrap();
        assert!(session.attendance.is_empty());
    }

    #[tokio::test]
    async fn overdue_sessions_are_swept_closed() {
        let ctx = TestContext::new();
        let (short, _) = ctx.open(VerificationMethod::Nfc, 10, None).await;
        let (long, _) = ctx.open(VerificationMethod::Nfc, 60, None).await;
        assert_eq!(ctx.service.active_sessions(), 2);

        ctx.clock.advance(Duration::minutes(11));
        let closed = ctx.service.sweep_overdue().await;

        assert_eq!(closed, vec![short.id]);
        assert_eq!(
            ctx.service.get_session(short.id).await.unwrap().status,
            SessionStatus::Completed
        );
        assert!(ctx.service.get_session(long.id).await.unwrap().is_active());
        assert_eq!(ctx.service.active_sessions(), 1);
    }

    #[tokio::test]
    async fn record_listing_is_restricted() {
        let ctx = TestContext::new();
        let m1 = ctx.enrolled_member();
        let m2 = ctx.enrolled_member();
        let (session, issued) = ctx.open(VerificationMethod::Qr, 15, None).await;
        let token = issued.unwrap().payload;

        ctx.mark(session.id, m1, Credential::Qr(token.clone()), None)
            .await
            .unwrap();
        ctx.clock.advance(Duration::minutes(1));
        ctx.mark(session.id, m2, Credential::Qr(token), None)
            .await
            .unwrap();

        let own = ctx
            .service
            .list_records(m1, RecordFilter { member_id: Some(m1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].member_id, m1);

        let peeking = ctx
            .service
            .list_records(m1, RecordFilter { member_id: Some(m2), ..Default::default() })
            .await;
        assert!(matches!(peeking, Err(AppError::NotAuthorized)));

        let as_member = ctx
            .service
            .list_records(m1, RecordFilter { group_id: Some(ctx.group_id), ..Default::default() })
            .await;
        assert!(matches!(as_member, Err(AppError::NotAuthorized)));

        let roster = ctx
            .service
            .list_records(
                ctx.authority,
                RecordFilter { group_id: Some(ctx.group_id), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].member_id, m2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_membership_lookups_do_not_serialize_marks() {
        const MEMBERS: usize = 4;
        let delay = StdDuration::from_millis(300);

        let ctx = TestContext::assemble(
            FaceExtraction::disabled(),
            AttendancePolicy::default(),
            |stores| Collaborators {
                groups: Arc::new(SlowGroupDirectory {
                    inner: stores.groups.clone(),
                    delay,
                }),
                ..stores
            },
        );
        let (session, _) = ctx.open(VerificationMethod::Nfc, 15, None).await;

        let mut tags = Vec::with_capacity(MEMBERS);
        for i in 0..MEMBERS {
            let member = ctx.enrolled_member();
            let tag = format!("04:00:{:02X}", i);
            ctx.identities.bind_tag(member, &tag);
            tags.push(tag);
        }

        let started = tokio::time::Instant::now();
        let results = futures::future::join_all(tags.into_iter().map(|tag| {
            ctx.mark(session.id, ctx.authority, Credential::Nfc(tag), None)
        }))
        .await;
        let elapsed = started.elapsed();

        assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);
        assert!(elapsed < delay * 2, "marks took {:?}", elapsed);
        assert_eq!(
            ctx.service.get_session(session.id).await.unwrap().attendance.len(),
            MEMBERS
        );
        assert_eq!(ctx.records.len(), MEMBERS);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_timeout_leaves_nothing_behind() {
        let policy = AttendancePolicy {
            storage_timeout: StdDuration::from_millis(50),
            ..AttendancePolicy::default()
        };
        let ctx = TestContext::assemble(FaceExtraction::disabled(), policy, |stores| {
            Collaborators {
                records: Arc::new(SlowRecordStore {
                    inner: stores.records.clone(),
                    delay: StdDuration::from_millis(200),
                }),
                ..stores
            }
        });
        let member = ctx.enrolled_member();
        let (session, issued) = ctx.open(VerificationMethod::Qr, 15, None).await;
        let mut events = ctx.service.subscribe(session.id, ctx.authority).await.unwrap();

        let result = ctx
            .mark(session.id, member, Credential::Qr(issued.unwrap().payload), None)
            .await;
        assert!(matches!(result, Err(AppError::StorageUnavailable(_))), "{:?}", result);

        let snapshot = ctx.service.get_session(session.id).await.unwrap();
        assert!(snapshot.attendance.is_empty());
        assert!(ctx.records.is_empty());

        ctx.service.close_session(session.id, ctx.authority).await.unwrap();
        let wait = StdDuration::from_secs(1);
        match tokio::time::timeout(wait, events.next()).await.unwrap() {
            Some(SessionEvent::SessionClosed { attendee_count, .. }) => {
                assert_eq!(attendee_count, 0);
            }
            other => panic!("expected SessionClosed, got {:?}", other),
        }
        assert!(tokio::time::timeout(wait, events.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_locations_are_rejected() {
        let ctx = TestContext::new();
        let member = ctx.enrolled_member();
        let (session, issued) = ctx
            .open(VerificationMethod::Qr, 15, Some(GeoPoint::new(0.0, 0.0)))
            .await;
        let token = issued.unwrap().payload;

        for location in [
            GeoPoint::new(f64::NAN, 0.0),
            GeoPoint::new(0.0, f64::NAN),
            GeoPoint::new(91.0, 0.0),
            GeoPoint::new(0.0, f64::INFINITY),
        ] {
            let result = ctx
                .mark(session.id, member, Credential::Qr(token.clone()), Some(location))
                .await;
            assert!(matches!(result, Err(AppError::Validation(_))), "{:?}", result);
        }

        assert!(ctx.records.is_empty());
        assert!(ctx.service.get_session(session.id).await.unwrap().attendance.is_empty());
    }

    #[tokio::test]
    async fn non_members_never_reach_face_extraction() {
        let extractor = Arc::new(CountingExtractor::default());
        let extraction = FaceExtraction::new(extractor.clone());
        extraction.initialize().await.unwrap();
        let ctx = TestContext::with_extraction(extraction);

        let outsider = Uuid::new_v4();
        ctx.identities.add_member(outsider);
        let (session, _) = ctx.open(VerificationMethod::Face, 15, None).await;

        let result = ctx
            .mark(session.id, outsider, Credential::FaceImage(vec![0xff, 0xd8]), None)
            .await;
        assert!(matches!(result, Err(AppError::NotEnrolled)));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn member_without_identity_row_has_no_face() {
        let ctx = TestContext::new();
        let member = Uuid::new_v4();
        ctx.groups.enroll(ctx.group_id, member);
        let (session, _) = ctx.open(VerificationMethod::Face, 15, None).await;

        let result = ctx
            .mark(session.id, member, Credential::Face(vec![0.0; DESCRIPTOR_LEN]), None)
            .await;
        assert!(matches!(result, Err(AppError::FaceNotRegistered)));
    }

    #[tokio::test]
    async fn record_summary_counts_and_is_restricted() {
        let ctx = TestContext::new();
        let m1 = ctx.enrolled_member();
        let m2 = ctx.enrolled_member();
        ctx.identities.bind_tag(m2, "04:10");

        let (qr, issued) = ctx.open(VerificationMethod::Hybrid, 15, None).await;
        ctx.mark(qr.id, m1, Credential::Qr(issued.unwrap().payload), None)
            .await
            .unwrap();
        ctx.mark(qr.id, ctx.authority, Credential::Nfc("04:10".into()), None)
            .await
            .unwrap();

        let (nfc, _) = ctx.open(VerificationMethod::Nfc, 15, None).await;
        ctx.mark(nfc.id, ctx.authority, Credential::Nfc("04:10".into()), None)
            .await
            .unwrap();

        let group = RecordFilter { group_id: Some(ctx.group_id), ..Default::default() };
        let summary = ctx
            .service
            .summarize_records(ctx.authority, group.clone())
            .await
            .unwrap();
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.sessions, 2);
        assert_eq!(summary.status.present, 3);
        assert_eq!(summary.methods.qr, 1);
        assert_eq!(summary.methods.nfc, 2);
        assert_eq!(summary.methods.face, 0);
        let tally = summary.members.iter().find(|t| t.member_id == m2).unwrap();
        assert_eq!(tally.counts.present, 2);

        let own = ctx
            .service
            .summarize_records(m1, RecordFilter { member_id: Some(m1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(own.total_records, 1);
        assert_eq!(own.members.len(), 1);

        let as_member = ctx.service.summarize_records(m1, group).await;
        assert!(matches!(as_member, Err(AppError::NotAuthorized)));
    }
}
