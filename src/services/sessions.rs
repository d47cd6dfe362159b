//! Owner of every mutable session record.
//!
//! Each session lives behind its own async mutex. Appending entries,
//! rotating the QR token and closing all happen under that lock, so the
//! check-then-append of duplicate suppression cannot race and nothing is
//! appended once a close has been observed. Different sessions never
//! contend with each other.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::{AppError, Result},
    models::{
        event::SessionEvent,
        session::{AttendanceEntry, GeoPoint, Session, SessionStatus, VerificationMethod},
    },
    repositories::groups::GroupDirectory,
    services::{
        events::{EventBus, EventStream},
        qr::{IssuedToken, QrTokenService},
    },
};

type SessionHandle = Arc<Mutex<Session>>;

/// Longest planned window, and longest QR TTL, a session may have.
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

/// Parameters for opening a session.
#[derive(Debug, Clone)]
pub struct OpenSession {
    pub group_id: Uuid,
    pub authority_id: Uuid,
    pub method: VerificationMethod,
    pub duration_minutes: i64,
    pub geofence: Option<GeoPoint>,
}

/// Exclusive access to one session for the duration of a check-and-commit.
pub struct SessionGuard {
    guard: OwnedMutexGuard<Session>,
}

impl SessionGuard {
    pub fn session(&self) -> &Session {
        &self.guard
    }

    /// Appends `entry`. The single mutation point of the attendance list.
    pub fn append_entry(&mut self, entry: AttendanceEntry) -> Result<()> {
        if !self.guard.is_active() {
            return Err(AppError::SessionClosed);
        }
        if self.guard.has_entry_for(entry.member_id) {
            return Err(AppError::AlreadyMarked);
        }
        self.guard.attendance.push(entry);
        Ok(())
    }

    /// Undoes an append whose durable record could not be written.
    pub(crate) fn retract_entry(&mut self, member_id: Uuid) {
        self.guard.attendance.retain(|e| e.member_id != member_id);
    }

    fn close(&mut self, now: DateTime<Utc>, events: &EventBus) {
        self.guard.status = SessionStatus::Completed;
        self.guard.ended_at = Some(now);
        self.guard.qr_token = None;

        events.publish(SessionEvent::SessionClosed {
            session_id: self.guard.id,
            ended_at: now,
            attendee_count: self.guard.attendance.len(),
        });
        events.retire(self.guard.id);
    }
}

#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
    groups: Arc<dyn GroupDirectory>,
    events: EventBus,
    qr: QrTokenService,
    clock: Arc<dyn Clock>,
    storage_timeout: Duration,
}

impl SessionStore {
    pub fn new(
        groups: Arc<dyn GroupDirectory>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            groups,
            events,
            qr: QrTokenService,
            clock,
            storage_timeout,
        }
    }

    fn handle(&self, session_id: Uuid) -> Result<SessionHandle> {
        self.sessions
            .read()
            .map_err(|_| AppError::Internal("session map poisoned".to_string()))?
            .get(&session_id)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    fn handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Opens a session for a group owned by `params.authority_id`.
    ///
    /// QR and hybrid sessions get a token valid for the session's duration;
    /// its rendering payload is returned alongside the session.
    pub async fn open(&self, params: OpenSession) -> Result<(Session, Option<IssuedToken>)> {
        if !(1..=MAX_DURATION_MINUTES).contains(&params.duration_minutes) {
            return Err(AppError::Validation(format!(
                "Duration must be between 1 and {} minutes",
                MAX_DURATION_MINUTES
            )));
        }
        if let Some(anchor) = &params.geofence {
            anchor.ensure_valid()?;
        }

        let owner = tokio::time::timeout(self.storage_timeout, self.groups.owner_of(params.group_id))
            .await??
            .ok_or(AppError::NotFound)?;
        if owner != params.authority_id {
            tracing::warn!(
                "🚫 {} tried to open a session for group {} owned by {}",
                params.authority_id,
                params.group_id,
                owner
            );
            return Err(AppError::NotAuthorized);
        }

        let now = self.clock.now();
        let id = Uuid::new_v4();
        let issued = params
            .method
            .issues_qr()
            .then(|| self.qr.issue(id, params.duration_minutes, now))
            .transpose()?;

        let session = Session {
            id,
            group_id: params.group_id,
            authority_id: params.authority_id,
            method: params.method,
            status: SessionStatus::Active,
            started_at: now,
            ended_at: None,
            duration_minutes: params.duration_minutes,
            geofence: params.geofence,
            qr_token: issued.as_ref().map(|i| i.token.clone()),
            attendance: Vec::new(),
        };

        self.sessions
            .write()
            .map_err(|_| AppError::Internal("session map poisoned".to_string()))?
            .insert(id, Arc::new(Mutex::new(session.clone())));

        tracing::info!(
            "🟢 Session {} opened for group {} ({:?}, {} min)",
            id,
            session.group_id,
            session.method,
            session.duration_minutes
        );

        Ok((session, issued))
    }

    /// A snapshot of the session.
    pub async fn get(&self, session_id: Uuid) -> Result<Session> {
        let handle = self.handle(session_id)?;
        let session = handle.lock().await;
        Ok(session.clone())
    }

    /// Takes the session's exclusive lock.
    pub async fn lock(&self, session_id: Uuid) -> Result<SessionGuard> {
        let handle = self.handle(session_id)?;
        Ok(SessionGuard { guard: handle.lock_owned().await })
    }

    /// Appends an entry and returns the updated session.
    pub async fn append_entry(&self, session_id: Uuid, entry: AttendanceEntry) -> Result<Session> {
        let mut guard = self.lock(session_id).await?;
        guard.append_entry(entry)?;
        Ok(guard.session().clone())
    }

    /// Closes the session. Only its authority may do so.
    pub async fn close(&self, session_id: Uuid, authority_id: Uuid) -> Result<Session> {
        let mut guard = self.lock(session_id).await?;
        if guard.session().authority_id != authority_id {
            return Err(AppError::NotAuthorized);
        }
        if !guard.session().is_active() {
            return Err(AppError::SessionClosed);
        }

        guard.close(self.clock.now(), &self.events);
        tracing::info!(
            "🔴 Session {} closed by authority ({} present)",
            session_id,
            guard.session().attendance.len()
        );
        Ok(guard.session().clone())
    }

    /// Replaces the session's QR token with a fresh one.
    pub async fn rotate_token(
        &self,
        session_id: Uuid,
        authority_id: Uuid,
        ttl_minutes: i64,
    ) -> Result<IssuedToken> {
        if !(1..=MAX_DURATION_MINUTES).contains(&ttl_minutes) {
            return Err(AppError::Validation(format!(
                "TTL must be between 1 and {} minutes",
                MAX_DURATION_MINUTES
            )));
        }

        let mut guard = self.lock(session_id).await?;
        if guard.session().authority_id != authority_id {
            return Err(AppError::NotAuthorized);
        }
        if !guard.session().is_active() {
            return Err(AppError::SessionClosed);
        }
        if !guard.session().method.issues_qr() {
            return Err(AppError::MethodNotAllowed);
        }

        let issued = self.qr.issue(session_id, ttl_minutes, self.clock.now())?;
        guard.guard.qr_token = Some(issued.token.clone());

        self.events.publish(SessionEvent::TokenRotated {
            session_id,
            expires_at: issued.token.expires_at,
        });
        tracing::info!("🔄 QR token rotated for session {}", session_id);
        Ok(issued)
    }

    /// Subscribes to the session's events. A completed session yields a
    /// stream that is already finished.
    pub async fn subscribe(&self, session_id: Uuid) -> Result<EventStream> {
        let guard = self.lock(session_id).await?;
        if !guard.session().is_active() {
            return Ok(EventStream::closed(session_id));
        }
        Ok(self.events.subscribe(session_id))
    }

    /// Closes every active session whose planned window has elapsed.
    pub async fn close_overdue(&self) -> Vec<Uuid> {
        let mut closed = Vec::new();
        for handle in self.handles() {
            let mut guard = SessionGuard { guard: handle.lock_owned().await };
            let now = self.clock.now();
            let overdue = guard.session().planned_end().is_some_and(|end| now >= end);
            if guard.session().is_active() && overdue {
                guard.close(now, &self.events);
                tracing::info!("⏰ Session {} closed after its planned window", guard.session().id);
                closed.push(guard.session().id);
            }
        }
        closed
    }

    /// Number of sessions still accepting attendance. Sessions whose lock is
    /// currently held are counted as active.
    pub fn active_count(&self) -> usize {
        self.handles()
            .iter()
            .filter(|h| h.try_lock().map(|s| s.is_active()).unwrap_or(true))
            .count()
    }
}
