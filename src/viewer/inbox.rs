//! Staff console session list. A fixed-interval poll and realtime pushes
//! both write into it; `version` decides which copy of a session wins.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::InboxSource;
use crate::types::{ServerEvent, Session, StaffFilter};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
struct InboxEntry {
    session: Session,
    pushed_since_snapshot: bool,
}

#[derive(Debug, Clone)]
pub struct StaffInbox {
    staff_id: String,
    entries: HashMap<String, InboxEntry>,
}

impl StaffInbox {
    pub fn new(staff_id: &str) -> Self {
        Self {
            staff_id: staff_id.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Replaces the projection with a poll result (always the `all` filter).
    /// Sessions the poll no longer returns are dropped unless a push
    /// touched them after the previous snapshot.
    pub fn apply_snapshot(&mut self, sessions: Vec<Session>) {
        let mut seen = std::collections::HashSet::new();
        for session in sessions {
            seen.insert(session.session_id.clone());
            self.upsert(session, false);
        }
        self.entries
            .retain(|id, entry| seen.contains(id) || entry.pushed_since_snapshot);
        for entry in self.entries.values_mut() {
            entry.pushed_since_snapshot = false;
        }
    }

    pub fn apply_update(&mut self, session: Session) -> bool {
        self.upsert(session, true)
    }

    pub fn apply_event(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::SessionUpdate(session) | ServerEvent::NewStaffRequest(session) => {
                self.apply_update(session.clone())
            }
            ServerEvent::NewMessage(_)
            | ServerEvent::SessionResolved { .. }
            | ServerEvent::AiToggled { .. }
            | ServerEvent::Error { .. } => false,
        }
    }

    fn upsert(&mut self, session: Session, from_push: bool) -> bool {
        match self.entries.get_mut(&session.session_id) {
            Some(entry) if entry.session.version >= session.version => false,
            Some(entry) => {
                entry.session = session;
                entry.pushed_since_snapshot |= from_push;
                true
            }
            None => {
                self.entries.insert(
                    session.session_id.clone(),
                    InboxEntry {
                        session,
                        pushed_since_snapshot: from_push,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.entries.get(session_id).map(|e| &e.session)
    }

    pub fn list(&self, filter: StaffFilter) -> Vec<Session> {
        let mut sessions = self
            .entries
            .values()
            .map(|e| &e.session)
            .filter(|s| filter.matches(s, &self.staff_id))
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        sessions
    }
}

/// Polls until `cancel` fires. A failed poll leaves the projection as it was.
pub fn spawn_inbox_poller(
    inbox: Arc<Mutex<StaffInbox>>,
    source: Arc<dyn InboxSource>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match source.list_sessions(StaffFilter::All).await {
                Ok(sessions) => inbox.lock().await.apply_snapshot(sessions),
                Err(err) => tracing::warn!(error = %err, "inbox poll failed; keeping previous list"),
            }
        }
        tracing::debug!("inbox poller stopped");
    })
}
