//! Room-based fanout of realtime events.
//!
//! Every physical connection gets an id and an unbounded outbound queue.
//! Rooms map a session id to the connections that joined it; the staff
//! channel is a separate set. Membership dies with the connection, so a
//! reconnecting client has to re-issue its joins.

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::types::ServerEvent;

pub type ConnectionId = usize;

#[derive(Default)]
struct RealtimeState {
    clients: HashMap<ConnectionId, mpsc::UnboundedSender<String>>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
    joined: HashMap<ConnectionId, HashSet<String>>,
    staff: HashSet<ConnectionId>,
}

impl RealtimeState {
    fn send_to<'a>(&self, ids: impl Iterator<Item = &'a ConnectionId>, payload: &str) -> usize {
        ids.filter_map(|id| self.clients.get(id))
            .filter(|tx| tx.send(payload.to_string()).is_ok())
            .count()
    }
}

#[derive(Default)]
pub struct FanoutHub {
    realtime: Mutex<RealtimeState>,
    next_client_id: AtomicUsize,
}

pub fn event_payload<T: Serialize>(event: &T) -> Option<String> {
    serde_json::to_string(event).ok()
}

impl FanoutHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        self.realtime.lock().await.clients.insert(client_id, tx);
        tracing::debug!(connection_id = client_id, "realtime client registered");
        (client_id, rx)
    }

    pub async fn disconnect(&self, client_id: ConnectionId) {
        let mut rt = self.realtime.lock().await;
        rt.clients.remove(&client_id);
        rt.staff.remove(&client_id);
        if let Some(rooms) = rt.joined.remove(&client_id) {
            for session_id in rooms {
                if let Some(members) = rt.rooms.get_mut(&session_id) {
                    members.remove(&client_id);
                    if members.is_empty() {
                        rt.rooms.remove(&session_id);
                    }
                }
            }
        }
        tracing::debug!(connection_id = client_id, "realtime client disconnected");
    }

    /// Returns false when the connection was already in the room or is unknown.
    pub async fn join(&self, client_id: ConnectionId, session_id: &str) -> bool {
        let mut rt = self.realtime.lock().await;
        if !rt.clients.contains_key(&client_id) {
            return false;
        }
        let added = rt
            .rooms
            .entry(session_id.to_string())
            .or_default()
            .insert(client_id);
        if added {
            rt.joined
                .entry(client_id)
                .or_default()
                .insert(session_id.to_string());
        }
        added
    }

    pub async fn leave(&self, client_id: ConnectionId, session_id: &str) -> bool {
        let mut rt = self.realtime.lock().await;
        let removed = match rt.rooms.get_mut(session_id) {
            Some(members) => {
                let removed = members.remove(&client_id);
                if members.is_empty() {
                    rt.rooms.remove(session_id);
                }
                removed
            }
            None => false,
        };
        if let Some(rooms) = rt.joined.get_mut(&client_id) {
            rooms.remove(session_id);
        }
        removed
    }

    pub async fn join_staff(&self, client_id: ConnectionId) -> bool {
        let mut rt = self.realtime.lock().await;
        rt.clients.contains_key(&client_id) && rt.staff.insert(client_id)
    }

    /// Delivers to every member of the room. Sending happens while the
    /// membership lock is held, so events for one room are queued in call order.
    pub async fn broadcast(&self, session_id: &str, event: &ServerEvent) -> usize {
        let Some(payload) = event_payload(event) else {
            return 0;
        };
        let rt = self.realtime.lock().await;
        match rt.rooms.get(session_id) {
            Some(members) => rt.send_to(members.iter(), &payload),
            None => 0,
        }
    }

    pub async fn broadcast_staff_wide(&self, event: &ServerEvent) -> usize {
        let Some(payload) = event_payload(event) else {
            return 0;
        };
        let rt = self.realtime.lock().await;
        rt.send_to(rt.staff.iter(), &payload)
    }

    pub async fn send_to_client(&self, client_id: ConnectionId, event: &ServerEvent) -> bool {
        let Some(payload) = event_payload(event) else {
            return false;
        };
        let rt = self.realtime.lock().await;
        rt.send_to(std::iter::once(&client_id), &payload) == 1
    }

    pub async fn room_size(&self, session_id: &str) -> usize {
        let rt = self.realtime.lock().await;
        rt.rooms.get(session_id).map(HashSet::len).unwrap_or(0)
    }

    pub async fn rooms_of(&self, client_id: ConnectionId) -> Vec<String> {
        let rt = self.realtime.lock().await;
        let mut rooms = rt
            .joined
            .get(&client_id)
            .map(|set| set.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }
}
