//! Session and message persistence.
//!
//! Two backends implement the same traits: [`MemoryStore`] for development
//! and tests, [`PgStore`] for production. The registry only ever changes a
//! session's status through [`SessionStore::compare_and_set`], so the
//! single-winner guarantee for concurrent accepts lives in the backend.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::StoreError;
use crate::types::{ChatMessage, CustomerInfo, Session, SessionStatus, StaffFilter};

/// What a successful compare-and-set does to the assignment columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Keep,
    Set { staff_id: String, staff_name: String },
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub to: SessionStatus,
    pub assignment: Assignment,
}

impl StatusChange {
    pub fn to(status: SessionStatus) -> Self {
        Self {
            to: status,
            assignment: Assignment::Keep,
        }
    }

    pub fn assign(mut self, staff_id: &str, staff_name: &str) -> Self {
        self.assignment = Assignment::Set {
            staff_id: staff_id.to_string(),
            staff_name: staff_name.to_string(),
        };
        self
    }

    pub fn clear_assignment(mut self) -> Self {
        self.assignment = Assignment::Clear;
        self
    }

    /// Applies the change to an in-memory record; used by backends that
    /// hold sessions as values.
    pub fn apply(&self, session: &mut Session) {
        session.status = self.to;
        match &self.assignment {
            Assignment::Keep => {}
            Assignment::Set {
                staff_id,
                staff_name,
            } => {
                session.assigned_staff_id = Some(staff_id.clone());
                session.assigned_staff_name = Some(staff_name.clone());
            }
            Assignment::Clear => {
                session.assigned_staff_id = None;
                session.assigned_staff_name = None;
            }
        }
        session.version += 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The status matched and the change was written.
    Applied(Session),
    /// Someone else moved the session first; carries the current record.
    Conflict(Session),
    Missing,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Inserts `session` unless a record with the same id exists; returns
    /// whichever record is stored afterwards and whether it was created.
    async fn insert_if_absent(&self, session: Session) -> Result<(Session, bool), StoreError>;

    /// Atomically applies `change` iff the current status is in `expected`.
    async fn compare_and_set(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        change: StatusChange,
    ) -> Result<CasOutcome, StoreError>;

    async fn set_customer_info(
        &self,
        session_id: &str,
        info: CustomerInfo,
    ) -> Result<Option<Session>, StoreError>;

    async fn touch(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError>;

    /// Sessions matching `filter` for `staff_id`, newest activity first.
    async fn list(&self, filter: StaffFilter, staff_id: &str) -> Result<Vec<Session>, StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: ChatMessage) -> Result<ChatMessage, StoreError>;

    /// The latest `limit` messages of a session in ascending order.
    async fn history(&self, session_id: &str, limit: usize)
        -> Result<Vec<ChatMessage>, StoreError>;
}
