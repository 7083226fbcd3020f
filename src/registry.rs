//! Authoritative session state and its transitions.
//!
//! ```text
//! ai ──request_staff──▶ waiting_staff ──accept (single winner)──▶ with_staff ──resolve──▶ resolved
//!  ▲                          │                                        │
//!  └──────── set_ai_enabled(true) ◀────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::ChatError;
use crate::hub::FanoutHub;
use crate::store::{CasOutcome, SessionStore, StatusChange};
use crate::types::{CustomerInfo, ServerEvent, Session, SessionStatus, StaffFilter, StaffIdentity};
use crate::validation::validate_session_id;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Held for the duration of a per-session exclusive section. The lock entry
/// is dropped from the map once nobody holds or waits on it.
pub struct SessionGuard {
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    hub: Arc<FanoutHub>,
    session_locks: Arc<LockMap>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, hub: Arc<FanoutHub>) -> Self {
        Self {
            store,
            hub,
            session_locks: Arc::new(DashMap::new()),
        }
    }

    /// Exclusive section for one session. Posting and resolving both take it,
    /// so a message either lands before the resolve or sees `resolved`.
    pub async fn lock_session(&self, session_id: &str) -> SessionGuard {
        let lock = self
            .session_locks
            .entry(session_id.to_string())
            .or_default()
            .clone();
        SessionGuard {
            session_id: session_id.to_string(),
            guard: Some(lock.lock_owned().await),
            locks: self.session_locks.clone(),
        }
    }

    pub async fn get(&self, session_id: &str) -> Result<Session, ChatError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))
    }

    pub async fn ensure_session(
        &self,
        session_id: &str,
        customer_info: Option<CustomerInfo>,
    ) -> Result<Session, ChatError> {
        let session_id = validate_session_id(session_id)?;
        let info = customer_info.and_then(CustomerInfo::normalized);
        let (session, created) = self
            .store
            .insert_if_absent(Session::new(session_id, info.clone()))
            .await?;
        if created {
            tracing::info!(session_id, "session created");
            return Ok(session);
        }
        match info {
            Some(info) if session.customer_info.as_ref() != Some(&info) => self
                .store
                .set_customer_info(session_id, info)
                .await?
                .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string())),
            _ => Ok(session),
        }
    }

    pub async fn request_staff(
        &self,
        session_id: &str,
        customer_info: Option<CustomerInfo>,
    ) -> Result<Session, ChatError> {
        let session = self.ensure_session(session_id, customer_info).await?;
        match session.status {
            SessionStatus::WaitingStaff | SessionStatus::WithStaff => return Ok(session),
            SessionStatus::Resolved => {
                return Err(ChatError::SessionResolved(session.session_id));
            }
            SessionStatus::Ai => {}
        }

        let outcome = self
            .store
            .compare_and_set(
                &session.session_id,
                &[SessionStatus::Ai],
                StatusChange::to(SessionStatus::WaitingStaff),
            )
            .await?;
        match outcome {
            CasOutcome::Applied(updated) => {
                tracing::info!(session_id = %updated.session_id, "staff requested");
                self.hub
                    .broadcast(
                        &updated.session_id,
                        &ServerEvent::SessionUpdate(updated.clone()),
                    )
                    .await;
                self.hub
                    .broadcast_staff_wide(&ServerEvent::NewStaffRequest(updated.clone()))
                    .await;
                Ok(updated)
            }
            // Lost a race with another request or a resolve; report what won.
            CasOutcome::Conflict(current) => match current.status {
                SessionStatus::Resolved => Err(ChatError::SessionResolved(current.session_id)),
                _ => Ok(current),
            },
            CasOutcome::Missing => Err(ChatError::SessionNotFound(session.session_id)),
        }
    }

    pub async fn accept_session(
        &self,
        session_id: &str,
        staff: &StaffIdentity,
    ) -> Result<Session, ChatError> {
        let outcome = self
            .store
            .compare_and_set(
                session_id,
                &[SessionStatus::WaitingStaff],
                StatusChange::to(SessionStatus::WithStaff).assign(&staff.id, &staff.name),
            )
            .await?;
        match outcome {
            CasOutcome::Applied(updated) => {
                tracing::info!(session_id, staff_id = %staff.id, "session accepted");
                self.hub
                    .broadcast(session_id, &ServerEvent::SessionUpdate(updated.clone()))
                    .await;
                self.hub
                    .broadcast_staff_wide(&ServerEvent::SessionUpdate(updated.clone()))
                    .await;
                Ok(updated)
            }
            CasOutcome::Conflict(current) if current.is_assigned_to(&staff.id) => Ok(current),
            CasOutcome::Conflict(current) => match current.status {
                SessionStatus::WithStaff => {
                    tracing::info!(
                        session_id,
                        staff_id = %staff.id,
                        winner = current.assigned_staff_id.as_deref().unwrap_or_default(),
                        "accept lost to another agent"
                    );
                    Err(ChatError::AlreadyAssigned {
                        session: Box::new(current),
                    })
                }
                from => Err(ChatError::InvalidTransition {
                    from,
                    action: "accept session",
                }),
            },
            CasOutcome::Missing => Err(ChatError::SessionNotFound(session_id.to_string())),
        }
    }

    /// `enabled = true` hands the session back to the assistant. Disabling
    /// never enters `waiting_staff`; that only happens via `request_staff`.
    pub async fn set_ai_enabled(
        &self,
        session_id: &str,
        enabled: bool,
        actor: &StaffIdentity,
    ) -> Result<Session, ChatError> {
        let session = self.get(session_id).await?;
        if !enabled {
            return match session.status {
                SessionStatus::WaitingStaff | SessionStatus::WithStaff => Ok(session),
                from => Err(ChatError::InvalidTransition {
                    from,
                    action: "disable the assistant",
                }),
            };
        }

        match session.status {
            SessionStatus::Ai => return Ok(session),
            SessionStatus::Resolved => {
                return Err(ChatError::SessionResolved(session.session_id));
            }
            SessionStatus::WaitingStaff | SessionStatus::WithStaff => {}
        }

        let outcome = self
            .store
            .compare_and_set(
                session_id,
                &[SessionStatus::WaitingStaff, SessionStatus::WithStaff],
                StatusChange::to(SessionStatus::Ai).clear_assignment(),
            )
            .await?;
        match outcome {
            CasOutcome::Applied(updated) => {
                tracing::info!(session_id, staff_id = %actor.id, "assistant re-enabled");
                self.hub
                    .broadcast(
                        session_id,
                        &ServerEvent::AiToggled {
                            session_id: session_id.to_string(),
                            enabled: true,
                        },
                    )
                    .await;
                self.hub
                    .broadcast(session_id, &ServerEvent::SessionUpdate(updated.clone()))
                    .await;
                self.hub
                    .broadcast_staff_wide(&ServerEvent::SessionUpdate(updated.clone()))
                    .await;
                Ok(updated)
            }
            CasOutcome::Conflict(current) => match current.status {
                SessionStatus::Ai => Ok(current),
                from => Err(ChatError::InvalidTransition {
                    from,
                    action: "enable the assistant",
                }),
            },
            CasOutcome::Missing => Err(ChatError::SessionNotFound(session_id.to_string())),
        }
    }

    pub async fn resolve(
        &self,
        session_id: &str,
        staff: &StaffIdentity,
    ) -> Result<Session, ChatError> {
        let session_id = validate_session_id(session_id)?;
        let _guard = self.lock_session(session_id).await;
        let outcome = self
            .store
            .compare_and_set(
                session_id,
                &[SessionStatus::WithStaff],
                StatusChange::to(SessionStatus::Resolved).clear_assignment(),
            )
            .await?;
        match outcome {
            CasOutcome::Applied(updated) => {
                tracing::info!(session_id, staff_id = %staff.id, "session resolved");
                self.hub
                    .broadcast(
                        session_id,
                        &ServerEvent::SessionResolved {
                            session_id: session_id.to_string(),
                            message: format!("Conversation resolved by {}", staff.name),
                            resolved_by: staff.name.clone(),
                        },
                    )
                    .await;
                self.hub
                    .broadcast(session_id, &ServerEvent::SessionUpdate(updated.clone()))
                    .await;
                self.hub
                    .broadcast_staff_wide(&ServerEvent::SessionUpdate(updated.clone()))
                    .await;
                Ok(updated)
            }
            CasOutcome::Conflict(current) => match current.status {
                SessionStatus::Resolved => Err(ChatError::SessionResolved(current.session_id)),
                from => Err(ChatError::InvalidTransition {
                    from,
                    action: "resolve",
                }),
            },
            CasOutcome::Missing => Err(ChatError::SessionNotFound(session_id.to_string())),
        }
    }

    pub async fn list_for_staff(
        &self,
        filter: StaffFilter,
        staff_id: &str,
    ) -> Result<Vec<Session>, ChatError> {
        Ok(self.store.list(filter, staff_id).await?)
    }

    pub async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<Session, ChatError> {
        let session = self
            .store
            .touch(session_id, at)
            .await?
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))?;
        self.hub
            .broadcast_staff_wide(&ServerEvent::SessionUpdate(session.clone()))
            .await;
        Ok(session)
    }
}
