//! One viewer's local copy of a conversation.
//!
//! Three writers feed it: optimistic inserts, send confirmations and
//! realtime pushes. Any of them may arrive first or twice; the timeline
//! never shows two entries for one message.

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::types::{Attachment, ChatMessage, ProductSnapshot, Sender};

/// Settled messages with the same origin and text this close together are
/// treated as one.
pub const DUPLICATE_WINDOW_MS: i64 = 2_000;

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerKind {
    Customer,
    Staff { staff_id: String, staff_name: String },
}

impl ViewerKind {
    fn own_sender(&self, product_data: Option<ProductSnapshot>) -> Sender {
        match self {
            ViewerKind::Customer => Sender::User,
            ViewerKind::Staff {
                staff_id,
                staff_name,
            } => Sender::Staff {
                staff_id: staff_id.clone(),
                staff_name: staff_name.clone(),
                product_data,
            },
        }
    }
}

fn same_origin(a: &Sender, b: &Sender) -> bool {
    match (a, b) {
        (Sender::User, Sender::User) | (Sender::Bot, Sender::Bot) => true,
        (Sender::Staff { staff_id: x, .. }, Sender::Staff { staff_id: y, .. }) => x == y,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub message: ChatMessage,
    pub pending: bool,
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// Replaced an optimistic entry.
    MergedPending,
    Duplicate,
    Appended,
}

#[derive(Debug, Clone)]
pub struct Timeline {
    kind: ViewerKind,
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new(kind: ViewerKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }

    pub fn kind(&self) -> &ViewerKind {
        &self.kind
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Inserts an optimistic entry and returns its temporary id, which the
    /// send carries as `clientMessageId`.
    pub fn begin_send(
        &mut self,
        session_id: &str,
        text: &str,
        attachment: Option<Attachment>,
        product_data: Option<ProductSnapshot>,
    ) -> String {
        let temp_id = format!("temp-{}", Uuid::new_v4());
        self.entries.push(TimelineEntry {
            message: ChatMessage {
                id: temp_id.clone(),
                session_id: session_id.to_string(),
                sender: self.kind.own_sender(product_data),
                text: text.trim().to_string(),
                attachment,
                client_message_id: Some(temp_id.clone()),
                created_at: Utc::now(),
            },
            pending: true,
            temp_id: Some(temp_id.clone()),
        });
        temp_id
    }

    /// Applies the authoritative copy returned by a successful send.
    pub fn confirm_send(&mut self, temp_id: &str, confirmed: ChatMessage) -> PushResult {
        if self.entries.iter().any(|e| e.message.id == confirmed.id) {
            // The push won the race and already merged; drop any leftover.
            self.entries
                .retain(|e| !(e.pending && e.temp_id.as_deref() == Some(temp_id)));
            return PushResult::Duplicate;
        }
        if let Some(index) = self
            .entries
            .iter()
            .position(|e| e.pending && e.temp_id.as_deref() == Some(temp_id))
        {
            self.settle(index, confirmed);
            return PushResult::MergedPending;
        }
        self.apply_push(confirmed)
    }

    pub fn apply_push(&mut self, message: ChatMessage) -> PushResult {
        if self.entries.iter().any(|e| e.message.id == message.id) {
            return PushResult::Duplicate;
        }

        let by_temp_id = message.client_message_id.as_deref().and_then(|cid| {
            self.entries
                .iter()
                .position(|e| e.pending && e.temp_id.as_deref() == Some(cid))
        });
        let pending = by_temp_id.or_else(|| {
            self.entries.iter().position(|e| {
                e.pending
                    && same_origin(&e.message.sender, &message.sender)
                    && e.message.text == message.text
            })
        });
        if let Some(index) = pending {
            self.settle(index, message);
            return PushResult::MergedPending;
        }

        let window = Duration::milliseconds(DUPLICATE_WINDOW_MS);
        let settled_duplicate = self.entries.iter().any(|e| {
            !e.pending
                && same_origin(&e.message.sender, &message.sender)
                && e.message.text == message.text
                && (e.message.created_at - message.created_at).abs() <= window
        });
        if settled_duplicate {
            return PushResult::Duplicate;
        }

        self.insert_settled(TimelineEntry {
            message,
            pending: false,
            temp_id: None,
        });
        PushResult::Appended
    }

    /// Replaces the pending entry at `index` with its server copy and moves
    /// it to its `createdAt` slot.
    fn settle(&mut self, index: usize, message: ChatMessage) {
        let mut entry = self.entries.remove(index);
        entry.message = message;
        entry.pending = false;
        self.insert_settled(entry);
    }

    /// Settled entries stay in `createdAt` order; pending ones keep their
    /// place until they settle.
    fn insert_settled(&mut self, entry: TimelineEntry) {
        let index = self
            .entries
            .iter()
            .position(|e| !e.pending && e.message.created_at > entry.message.created_at)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, entry);
    }

    /// Folds a history page in; safe to repeat.
    pub fn apply_history(&mut self, messages: Vec<ChatMessage>) {
        for message in messages {
            self.apply_push(message);
        }
    }

    /// The settled message for a send, if a confirmation or push arrived.
    pub fn delivered(&self, temp_id: &str) -> Option<&ChatMessage> {
        self.entries
            .iter()
            .find(|e| !e.pending && e.temp_id.as_deref() == Some(temp_id))
            .map(|e| &e.message)
    }

    pub fn fail_send(&mut self, temp_id: &str) -> Option<TimelineEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.pending && e.temp_id.as_deref() == Some(temp_id))?;
        Some(self.entries.remove(index))
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.pending).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_copy(id: &str, sender: Sender, text: &str, cid: Option<&str>) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            session_id: "s1".to_string(),
            sender,
            text: text.to_string(),
            attachment: None,
            client_message_id: cid.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn push_before_confirmation_leaves_one_entry() {
        let mut timeline = Timeline::new(ViewerKind::Customer);
        let temp = timeline.begin_send("s1", "hello", None, None);
        let echo = server_copy("m1", Sender::User, "hello", Some(&temp));

        assert_eq!(timeline.apply_push(echo.clone()), PushResult::MergedPending);
        assert_eq!(timeline.confirm_send(&temp, echo.clone()), PushResult::Duplicate);
        assert_eq!(timeline.apply_push(echo), PushResult::Duplicate);

        assert_eq!(timeline.entries().len(), 1);
        assert!(!timeline.entries()[0].pending);
        assert_eq!(timeline.delivered(&temp).map(|m| m.id.as_str()), Some("m1"));
    }

    #[test]
    fn push_without_client_id_matches_by_origin_and_text() {
        let mut timeline = Timeline::new(ViewerKind::Staff {
            staff_id: "a".to_string(),
            staff_name: "Lan".to_string(),
        });
        let temp = timeline.begin_send("s1", "On it", None, None);
        let echo = server_copy(
            "m1",
            Sender::Staff {
                staff_id: "a".to_string(),
                staff_name: "Lan".to_string(),
                product_data: None,
            },
            "On it",
            None,
        );
        assert_eq!(timeline.apply_push(echo.clone()), PushResult::MergedPending);
        assert_eq!(timeline.confirm_send(&temp, echo), PushResult::Duplicate);
        assert_eq!(timeline.pending_count(), 0);
        assert_eq!(timeline.entries().len(), 1);
    }

    #[test]
    fn other_origins_never_merge_into_pending() {
        let mut timeline = Timeline::new(ViewerKind::Customer);
        timeline.begin_send("s1", "ok", None, None);
        let bot = server_copy("b1", Sender::Bot, "ok", None);
        assert_eq!(timeline.apply_push(bot), PushResult::Appended);
        assert_eq!(timeline.pending_count(), 1);
    }

    #[test]
    fn settled_near_duplicate_is_dropped() {
        let mut timeline = Timeline::new(ViewerKind::Customer);
        timeline.apply_push(server_copy("m1", Sender::Bot, "Hi!", None));
        assert_eq!(
            timeline.apply_push(server_copy("m2", Sender::Bot, "Hi!", None)),
            PushResult::Duplicate
        );

        let mut later = server_copy("m3", Sender::Bot, "Hi!", None);
        later.created_at += Duration::seconds(10);
        assert_eq!(timeline.apply_push(later), PushResult::Appended);
    }

    #[test]
    fn failed_send_is_removed() {
        let mut timeline = Timeline::new(ViewerKind::Customer);
        let temp = timeline.begin_send("s1", "lost", None, None);
        assert!(timeline.delivered(&temp).is_none());
        assert!(timeline.fail_send(&temp).is_some());
        assert!(timeline.entries().is_empty());
        assert!(timeline.fail_send(&temp).is_none());
    }

    #[test]
    fn history_after_live_push_stays_in_created_order() {
        let mut timeline = Timeline::new(ViewerKind::Customer);
        let start = Utc::now();
        let at = |id: &str, secs: i64| {
            let mut message = server_copy(id, Sender::Bot, id, None);
            message.created_at = start + Duration::seconds(secs);
            message
        };

        timeline.apply_push(at("late", 10));
        timeline.apply_history(vec![at("early", 0), at("mid", 5), at("late", 10)]);

        let ids = timeline
            .entries()
            .iter()
            .map(|e| e.message.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["early", "mid", "late"]);
    }

    #[test]
    fn confirmed_send_moves_to_its_server_slot() {
        let mut timeline = Timeline::new(ViewerKind::Customer);
        let temp = timeline.begin_send("s1", "first", None, None);
        let mut reply = server_copy("b1", Sender::Bot, "reply", None);
        reply.created_at = Utc::now() + Duration::seconds(5);
        timeline.apply_push(reply);

        let mut confirmed = server_copy("m1", Sender::User, "first", Some(&temp));
        confirmed.created_at = Utc::now();
        assert_eq!(timeline.confirm_send(&temp, confirmed), PushResult::MergedPending);

        let ids = timeline
            .entries()
            .iter()
            .map(|e| e.message.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["m1", "b1"]);
    }

    #[test]
    fn history_replay_is_idempotent() {
        let mut timeline = Timeline::new(ViewerKind::Customer);
        let page = vec![
            server_copy("m1", Sender::User, "a", None),
            server_copy("m2", Sender::Bot, "b", None),
        ];
        timeline.apply_history(page.clone());
        timeline.apply_history(page);
        assert_eq!(timeline.entries().len(), 2);
    }
}
