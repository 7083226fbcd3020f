use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Ai,
    WaitingStaff,
    WithStaff,
    Resolved,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Ai => "ai",
            SessionStatus::WaitingStaff => "waiting_staff",
            SessionStatus::WithStaff => "with_staff",
            SessionStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "ai" => Ok(SessionStatus::Ai),
            "waiting_staff" => Ok(SessionStatus::WaitingStaff),
            "with_staff" => Ok(SessionStatus::WithStaff),
            "resolved" => Ok(SessionStatus::Resolved),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CustomerInfo {
    /// Drops blank names so an empty form field never overwrites a known name.
    pub fn normalized(self) -> Option<CustomerInfo> {
        let name = self
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())?;
        Some(CustomerInfo { name: Some(name) })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub assigned_staff_id: Option<String>,
    #[serde(default)]
    pub assigned_staff_name: Option<String>,
    #[serde(default)]
    pub customer_info: Option<CustomerInfo>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub version: i64,
}

impl Session {
    pub fn new(session_id: &str, customer_info: Option<CustomerInfo>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            status: SessionStatus::Ai,
            assigned_staff_id: None,
            assigned_staff_name: None,
            customer_info: customer_info.and_then(CustomerInfo::normalized),
            created_at: now,
            last_message_at: now,
            version: 1,
        }
    }

    pub fn is_assigned_to(&self, staff_id: &str) -> bool {
        self.status == SessionStatus::WithStaff
            && self.assigned_staff_id.as_deref() == Some(staff_id)
    }
}

/// Which sessions a staff console asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffFilter {
    /// Sessions waiting for any agent.
    #[default]
    Waiting,
    /// Sessions the caller currently owns.
    Mine,
    /// Waiting, owned by the caller, and resolved.
    All,
}

impl StaffFilter {
    pub fn matches(&self, session: &Session, staff_id: &str) -> bool {
        let waiting = session.status == SessionStatus::WaitingStaff;
        let mine = session.is_assigned_to(staff_id);
        match self {
            StaffFilter::Waiting => waiting,
            StaffFilter::Mine => mine,
            StaffFilter::All => waiting || mine || session.status == SessionStatus::Resolved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
}

impl AttachmentKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mt = mime.to_ascii_lowercase();
        if mt.starts_with("image/") {
            Some(AttachmentKind::Image)
        } else if mt.starts_with("video/") {
            Some(AttachmentKind::Video)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    #[serde(default)]
    pub public_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// Denormalized product card an agent attaches to a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    #[serde(default)]
    pub id: Option<String>,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    pub price: f64,
    #[serde(default)]
    pub original_price: Option<f64>,
    #[serde(default)]
    pub discount_percent: Option<u32>,
    #[serde(default)]
    pub promotion_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Sender {
    User,
    Bot,
    Staff {
        staff_id: String,
        staff_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        product_data: Option<ProductSnapshot>,
    },
}

impl Sender {
    pub fn kind(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
            Sender::Staff { .. } => "staff",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    #[serde(flatten)]
    pub sender: Sender,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffIdentity {
    pub id: String,
    pub name: String,
    #[serde(default = "default_staff_role")]
    pub role: String,
}

fn default_staff_role() -> String {
    "staff".to_string()
}

/// Events pushed to realtime clients as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(ChatMessage),
    SessionUpdate(Session),
    #[serde(rename_all = "camelCase")]
    SessionResolved {
        session_id: String,
        message: String,
        resolved_by: String,
    },
    #[serde(rename_all = "camelCase")]
    AiToggled { session_id: String, enabled: bool },
    NewStaffRequest(Session),
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

impl ServerEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::NewMessage(message) => Some(&message.session_id),
            ServerEvent::SessionUpdate(session) | ServerEvent::NewStaffRequest(session) => {
                Some(&session.session_id)
            }
            ServerEvent::SessionResolved { session_id, .. }
            | ServerEvent::AiToggled { session_id, .. } => Some(session_id),
            ServerEvent::Error { .. } => None,
        }
    }
}

/// Frames a realtime client sends to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "session:join", rename_all = "camelCase")]
    JoinSession { session_id: String },
    #[serde(rename = "session:leave", rename_all = "camelCase")]
    LeaveSession { session_id: String },
    #[serde(rename = "staff:join")]
    JoinStaff { token: String },
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageBody {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub customer_info: Option<CustomerInfo>,
    #[serde(default)]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffMessageBody {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub product_data: Option<ProductSnapshot>,
    #[serde(default)]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStaffBody {
    #[serde(default)]
    pub customer_info: Option<CustomerInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionBody {
    #[serde(default)]
    pub customer_info: Option<CustomerInfo>,
    #[serde(default)]
    pub previous_session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiToggleBody {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaffSessionsQuery {
    #[serde(default)]
    pub filter: Option<StaffFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostOutcome {
    pub session_id: String,
    pub user_message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_message: Option<ChatMessage>,
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn staff_message_serializes_flat_with_from_tag() {
        let message = ChatMessage {
            id: "m1".to_string(),
            session_id: "s1".to_string(),
            sender: Sender::Staff {
                staff_id: "st-1".to_string(),
                staff_name: "Lan".to_string(),
                product_data: None,
            },
            text: "hello".to_string(),
            attachment: None,
            client_message_id: None,
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["from"], "staff");
        assert_eq!(value["staffName"], "Lan");
        assert_eq!(value["sessionId"], "s1");

        let back: ChatMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn server_event_uses_event_envelope() {
        let event = ServerEvent::AiToggled {
            session_id: "s1".to_string(),
            enabled: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({ "event": "ai_toggled", "data": { "sessionId": "s1", "enabled": false } })
        );
    }

    #[test]
    fn client_frames_parse_from_wire_names() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"event":"session:join","data":{"sessionId":"abc"}}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::JoinSession {
                session_id: "abc".to_string()
            }
        );
        let ping: ClientFrame = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(ping, ClientFrame::Ping);
    }

    #[test]
    fn blank_customer_name_is_dropped() {
        let info = CustomerInfo {
            name: Some("   ".to_string()),
        };
        assert!(info.normalized().is_none());
    }

    #[test]
    fn all_filter_includes_resolved_but_not_foreign_sessions() {
        let mut session = Session::new("s1", None);
        session.status = SessionStatus::WithStaff;
        session.assigned_staff_id = Some("other".to_string());
        assert!(!StaffFilter::All.matches(&session, "me"));
        session.status = SessionStatus::Resolved;
        assert!(StaffFilter::All.matches(&session, "me"));
    }
}
