use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{CasOutcome, MessageStore, SessionStore, StatusChange};
use crate::error::StoreError;
use crate::types::{ChatMessage, CustomerInfo, Session, SessionStatus, StaffFilter};

/// Process-local store. Compare-and-set runs under the sessions write lock,
/// which makes the status check and the write one step.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    messages: RwLock<HashMap<String, Vec<ChatMessage>>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.check_online()?;
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn insert_if_absent(&self, session: Session) -> Result<(Session, bool), StoreError> {
        self.check_online()?;
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&session.session_id) {
            return Ok((existing.clone(), false));
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok((session, true))
    }

    async fn compare_and_set(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        change: StatusChange,
    ) -> Result<CasOutcome, StoreError> {
        self.check_online()?;
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(CasOutcome::Missing);
        };
        if !expected.contains(&session.status) {
            return Ok(CasOutcome::Conflict(session.clone()));
        }
        change.apply(session);
        Ok(CasOutcome::Applied(session.clone()))
    }

    async fn set_customer_info(
        &self,
        session_id: &str,
        info: CustomerInfo,
    ) -> Result<Option<Session>, StoreError> {
        self.check_online()?;
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(None);
        };
        if session.customer_info.as_ref() != Some(&info) {
            session.customer_info = Some(info);
            session.version += 1;
        }
        Ok(Some(session.clone()))
    }

    async fn touch(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        self.check_online()?;
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(None);
        };
        if at > session.last_message_at {
            session.last_message_at = at;
        }
        session.version += 1;
        Ok(Some(session.clone()))
    }

    async fn list(&self, filter: StaffFilter, staff_id: &str) -> Result<Vec<Session>, StoreError> {
        self.check_online()?;
        let mut list = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| filter.matches(s, staff_id))
                .cloned()
                .collect::<Vec<_>>()
        };
        list.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(list)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        self.check_online()?;
        let mut messages = self.messages.write().await;
        let log = messages.entry(message.session_id.clone()).or_default();
        // Keep createdAt ascending; equal timestamps stay in insertion order.
        let position = log.partition_point(|m| m.created_at <= message.created_at);
        log.insert(position, message.clone());
        Ok(message)
    }

    async fn history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.check_online()?;
        let messages = self.messages.read().await;
        let Some(log) = messages.get(session_id) else {
            return Ok(Vec::new());
        };
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }
}
