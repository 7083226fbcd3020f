//! Client-side view of a conversation: the customer widget and the staff
//! console share this code and differ only in [`ViewerKind`].

pub mod inbox;
pub mod timeline;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::chat::ChatService;
use crate::error::ChatError;
use crate::hydrator::{referenced_slugs, scan, ProductHydrator, ProductRef, ProductState};
use crate::types::{
    Attachment, ChatMessage, ClientFrame, PostMessageBody, PostOutcome, ProductSnapshot,
    ServerEvent, Session, StaffFilter, StaffIdentity, StaffMessageBody,
};
use crate::validation::validate_outgoing;

pub use inbox::{spawn_inbox_poller, StaffInbox};
pub use timeline::{PushResult, Timeline, TimelineEntry, ViewerKind};

/// How long a failed send waits for the push channel before giving up.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1_500);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("{0}")]
    Invalid(String),

    #[error("server rejected message ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("message was not delivered: {0}")]
    NotDelivered(String),
}

#[derive(Debug, Clone)]
pub enum Outgoing {
    Customer(PostMessageBody),
    Staff(StaffMessageBody),
}

/// What the server answered for a send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// May differ from the session the message was sent to when a resolved
    /// session was rotated.
    pub session_id: String,
    pub message: ChatMessage,
    pub replies: Vec<ChatMessage>,
}

impl From<PostOutcome> for SendReceipt {
    fn from(outcome: PostOutcome) -> Self {
        Self {
            session_id: outcome.session_id,
            message: outcome.user_message,
            replies: outcome.bot_message.into_iter().collect(),
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, session_id: &str, outgoing: &Outgoing)
        -> Result<SendReceipt, TransportError>;

    async fn history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, TransportError>;
}

#[async_trait]
pub trait InboxSource: Send + Sync {
    async fn list_sessions(&self, filter: StaffFilter) -> Result<Vec<Session>, TransportError>;
}

struct ViewerState {
    session_id: String,
    session: Option<Session>,
    resolved_notice: Option<String>,
    timeline: Timeline,
}

pub struct Viewer {
    transport: Arc<dyn ChatTransport>,
    hydrator: Option<Arc<ProductHydrator>>,
    staff_token: Option<String>,
    grace: Duration,
    max_message_chars: usize,
    state: Mutex<ViewerState>,
}

impl Viewer {
    pub fn new(kind: ViewerKind, session_id: &str, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            transport,
            hydrator: None,
            staff_token: None,
            grace: DEFAULT_GRACE_PERIOD,
            max_message_chars: 4000,
            state: Mutex::new(ViewerState {
                session_id: session_id.to_string(),
                session: None,
                resolved_notice: None,
                timeline: Timeline::new(kind),
            }),
        }
    }

    pub fn with_staff_token(mut self, token: &str) -> Self {
        self.staff_token = Some(token.to_string());
        self
    }

    pub fn with_hydrator(mut self, hydrator: Arc<ProductHydrator>) -> Self {
        self.hydrator = Some(hydrator);
        self
    }

    /// Product references in a message with their current hydration state.
    pub fn product_cards(&self, message: &ChatMessage) -> Vec<(ProductRef, ProductState)> {
        scan(&message.text)
            .into_iter()
            .map(|product| {
                let state = self
                    .hydrator
                    .as_ref()
                    .map_or(ProductState::Pending, |h| h.state(&product.slug));
                (product, state)
            })
            .collect()
    }

    /// Starts background hydration for whatever the messages reference.
    fn hydrate_references<'a>(&self, messages: impl IntoIterator<Item = &'a ChatMessage>) {
        let Some(hydrator) = &self.hydrator else {
            return;
        };
        let slugs = messages
            .into_iter()
            .flat_map(referenced_slugs)
            .collect::<Vec<_>>();
        if !slugs.is_empty() {
            hydrator.spawn_hydrate(slugs);
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_max_message_chars(mut self, max: usize) -> Self {
        self.max_message_chars = max;
        self
    }

    pub async fn session_id(&self) -> String {
        self.state.lock().await.session_id.clone()
    }

    pub async fn entries(&self) -> Vec<TimelineEntry> {
        self.state.lock().await.timeline.entries().to_vec()
    }

    pub async fn session(&self) -> Option<Session> {
        self.state.lock().await.session.clone()
    }

    pub async fn resolved_notice(&self) -> Option<String> {
        self.state.lock().await.resolved_notice.clone()
    }

    /// Frames to replay after a reconnect; the hub forgets memberships.
    pub async fn rejoin_frames(&self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        if let Some(token) = &self.staff_token {
            frames.push(ClientFrame::JoinStaff {
                token: token.clone(),
            });
        }
        frames.push(ClientFrame::JoinSession {
            session_id: self.session_id().await,
        });
        frames
    }

    pub async fn load_history(&self, limit: usize) -> Result<(), TransportError> {
        let session_id = self.session_id().await;
        let messages = self.transport.history(&session_id, limit).await?;
        self.hydrate_references(&messages);
        self.state.lock().await.timeline.apply_history(messages);
        Ok(())
    }

    /// Applies a realtime event. Events for other sessions are ignored.
    pub async fn on_event(&self, event: &ServerEvent) -> Option<PushResult> {
        let mut state = self.state.lock().await;
        if event.session_id() != Some(state.session_id.as_str()) {
            return None;
        }
        match event {
            ServerEvent::NewMessage(message) => {
                let result = state.timeline.apply_push(message.clone());
                if result != PushResult::Duplicate {
                    self.hydrate_references([message]);
                }
                Some(result)
            }
            ServerEvent::SessionUpdate(session) | ServerEvent::NewStaffRequest(session) => {
                let newer = state
                    .session
                    .as_ref()
                    .map_or(true, |current| current.version < session.version);
                if newer {
                    state.session = Some(session.clone());
                }
                None
            }
            ServerEvent::SessionResolved { message, .. } => {
                state.resolved_notice = Some(message.clone());
                None
            }
            ServerEvent::AiToggled { .. } | ServerEvent::Error { .. } => None,
        }
    }

    pub async fn send(&self, text: &str, attachment: Option<Attachment>) -> Result<ChatMessage, SendError> {
        self.send_with_product(text, attachment, None).await
    }

    /// Optimistic send. The entry shows immediately; a transport failure
    /// only surfaces after the grace period confirms the push never came.
    pub async fn send_with_product(
        &self,
        text: &str,
        attachment: Option<Attachment>,
        product_data: Option<ProductSnapshot>,
    ) -> Result<ChatMessage, SendError> {
        let product_only = product_data.is_some() && text.trim().is_empty() && attachment.is_none();
        if !product_only {
            validate_outgoing(text, attachment.as_ref(), self.max_message_chars).map_err(
                |err| match err {
                    ChatError::Validation(message) => SendError::Invalid(message),
                    other => SendError::Invalid(other.to_string()),
                },
            )?;
        }

        let (session_id, temp_id, outgoing) = {
            let mut state = self.state.lock().await;
            let session_id = state.session_id.clone();
            let temp_id = state.timeline.begin_send(
                &session_id,
                text,
                attachment.clone(),
                product_data.clone(),
            );
            let outgoing = match state.timeline.kind() {
                ViewerKind::Customer => Outgoing::Customer(PostMessageBody {
                    text: text.trim().to_string(),
                    attachment,
                    customer_info: None,
                    client_message_id: Some(temp_id.clone()),
                }),
                ViewerKind::Staff { .. } => Outgoing::Staff(StaffMessageBody {
                    text: text.trim().to_string(),
                    attachment,
                    product_data,
                    client_message_id: Some(temp_id.clone()),
                }),
            };
            (session_id, temp_id, outgoing)
        };

        match self.transport.send(&session_id, &outgoing).await {
            Ok(receipt) => {
                let mut state = self.state.lock().await;
                if receipt.session_id != state.session_id {
                    tracing::info!(
                        previous_session_id = %state.session_id,
                        session_id = %receipt.session_id,
                        "conversation moved to a new session"
                    );
                    state.session_id = receipt.session_id.clone();
                    state.session = None;
                    state.resolved_notice = None;
                    state.timeline.clear();
                }
                let message = receipt.message.clone();
                self.hydrate_references(&receipt.replies);
                state.timeline.confirm_send(&temp_id, receipt.message);
                for reply in receipt.replies {
                    state.timeline.apply_push(reply);
                }
                Ok(message)
            }
            Err(TransportError::Rejected { status, message }) => {
                self.state.lock().await.timeline.fail_send(&temp_id);
                Err(SendError::Rejected { status, message })
            }
            Err(err) => {
                tracing::debug!(error = %err, "send failed; waiting for push delivery");
                tokio::time::sleep(self.grace).await;
                let mut state = self.state.lock().await;
                if let Some(delivered) = state.timeline.delivered(&temp_id) {
                    return Ok(delivered.clone());
                }
                state.timeline.fail_send(&temp_id);
                Err(SendError::NotDelivered(err.to_string()))
            }
        }
    }
}

/// Talks to a running server over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    staff_token: Option<String>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: &str, staff_token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            staff_token,
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.staff_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        if status.is_server_error() {
            return Err(TransportError::Network(format!("{status}: {message}")));
        }
        Err(TransportError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(
        &self,
        session_id: &str,
        outgoing: &Outgoing,
    ) -> Result<SendReceipt, TransportError> {
        match outgoing {
            Outgoing::Customer(body) => {
                let response = self
                    .client
                    .post(format!("{}/api/session/{session_id}/message", self.base_url))
                    .json(body)
                    .send()
                    .await?;
                Ok(Self::read_json::<PostOutcome>(response).await?.into())
            }
            Outgoing::Staff(body) => {
                let response = self
                    .authorized(
                        self.client
                            .post(format!("{}/api/session/{session_id}/staff-message", self.base_url)),
                    )
                    .json(body)
                    .send()
                    .await?;
                let message = Self::read_json::<ChatMessage>(response).await?;
                Ok(SendReceipt {
                    session_id: session_id.to_string(),
                    message,
                    replies: Vec::new(),
                })
            }
        }
    }

    async fn history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, TransportError> {
        let response = self
            .client
            .get(format!("{}/api/session/{session_id}/messages", self.base_url))
            .query(&[("limit", limit)])
            .send()
            .await?;
        Self::read_json(response).await
    }
}

#[async_trait]
impl InboxSource for HttpTransport {
    async fn list_sessions(&self, filter: StaffFilter) -> Result<Vec<Session>, TransportError> {
        let filter = match filter {
            StaffFilter::Waiting => "waiting",
            StaffFilter::Mine => "mine",
            StaffFilter::All => "all",
        };
        let response = self
            .authorized(self.client.get(format!("{}/api/staff/sessions", self.base_url)))
            .query(&[("filter", filter)])
            .send()
            .await?;
        Self::read_json(response).await
    }
}

/// Drives a [`ChatService`] in the same process; used by embedders and tests.
pub struct InProcessTransport {
    chat: Arc<ChatService>,
    staff: Option<StaffIdentity>,
}

impl InProcessTransport {
    pub fn customer(chat: Arc<ChatService>) -> Self {
        Self { chat, staff: None }
    }

    pub fn staff(chat: Arc<ChatService>, staff: StaffIdentity) -> Self {
        Self {
            chat,
            staff: Some(staff),
        }
    }
}

fn transport_error(err: ChatError) -> TransportError {
    match err {
        ChatError::Store(_) | ChatError::Internal(_) => TransportError::Network(err.to_string()),
        ChatError::Validation(_) => TransportError::Rejected {
            status: 400,
            message: err.to_string(),
        },
        ChatError::Unauthorized(_) => TransportError::Rejected {
            status: 401,
            message: err.to_string(),
        },
        ChatError::NotAssigned => TransportError::Rejected {
            status: 403,
            message: err.to_string(),
        },
        ChatError::SessionNotFound(_) | ChatError::NotFound(_) => TransportError::Rejected {
            status: 404,
            message: err.to_string(),
        },
        ChatError::AlreadyAssigned { .. }
        | ChatError::InvalidTransition { .. }
        | ChatError::SessionResolved(_) => TransportError::Rejected {
            status: 409,
            message: err.to_string(),
        },
    }
}

#[async_trait]
impl ChatTransport for InProcessTransport {
    async fn send(
        &self,
        session_id: &str,
        outgoing: &Outgoing,
    ) -> Result<SendReceipt, TransportError> {
        match outgoing {
            Outgoing::Customer(body) => self
                .chat
                .post_message(session_id, body.clone())
                .await
                .map(SendReceipt::from)
                .map_err(transport_error),
            Outgoing::Staff(body) => {
                let staff = self.staff.as_ref().ok_or_else(|| TransportError::Rejected {
                    status: 401,
                    message: "missing bearer token".to_string(),
                })?;
                let message = self
                    .chat
                    .post_staff_message(session_id, staff, body.clone())
                    .await
                    .map_err(transport_error)?;
                Ok(SendReceipt {
                    session_id: session_id.to_string(),
                    message,
                    replies: Vec::new(),
                })
            }
        }
    }

    async fn history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, TransportError> {
        self.chat
            .history(session_id, Some(limit))
            .await
            .map_err(transport_error)
    }
}

#[async_trait]
impl InboxSource for InProcessTransport {
    async fn list_sessions(&self, filter: StaffFilter) -> Result<Vec<Session>, TransportError> {
        let staff_id = self.staff.as_ref().map(|s| s.id.as_str()).unwrap_or_default();
        self.chat
            .registry()
            .list_for_staff(filter, staff_id)
            .await
            .map_err(transport_error)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::types::Sender;

    struct LossyTransport {
        sends: AtomicUsize,
    }

    #[async_trait]
    impl ChatTransport for LossyTransport {
        async fn send(
            &self,
            _session_id: &str,
            _outgoing: &Outgoing,
        ) -> Result<SendReceipt, TransportError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Network("connection reset".to_string()))
        }

        async fn history(
            &self,
            _session_id: &str,
            _limit: usize,
        ) -> Result<Vec<ChatMessage>, TransportError> {
            Ok(Vec::new())
        }
    }

    fn lossy() -> Arc<LossyTransport> {
        Arc::new(LossyTransport {
            sends: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn invalid_send_never_reaches_transport() {
        let transport = lossy();
        let viewer = Viewer::new(ViewerKind::Customer, "s1", transport.clone());
        assert!(matches!(viewer.send("   ", None).await, Err(SendError::Invalid(_))));
        assert_eq!(transport.sends.load(Ordering::SeqCst), 0);
        assert!(viewer.entries().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_send_is_dropped_after_grace() {
        let viewer = Viewer::new(ViewerKind::Customer, "s1", lossy());
        let err = viewer.send("hello", None).await.unwrap_err();
        assert!(matches!(err, SendError::NotDelivered(_)));
        assert!(viewer.entries().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn push_during_grace_turns_failure_into_success() {
        let viewer = Arc::new(Viewer::new(ViewerKind::Customer, "s1", lossy()));
        let sending = {
            let viewer = viewer.clone();
            tokio::spawn(async move { viewer.send("hello", None).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        let echo = ChatMessage {
            id: "m1".to_string(),
            session_id: "s1".to_string(),
            sender: Sender::User,
            text: "hello".to_string(),
            attachment: None,
            client_message_id: None,
            created_at: Utc::now(),
        };
        assert_eq!(
            viewer.on_event(&ServerEvent::NewMessage(echo)).await,
            Some(PushResult::MergedPending)
        );

        let delivered = sending.await.unwrap().unwrap();
        assert_eq!(delivered.id, "m1");
        assert_eq!(viewer.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn rejoin_frames_include_staff_channel() {
        let viewer = Viewer::new(
            ViewerKind::Staff {
                staff_id: "a".to_string(),
                staff_name: "Lan".to_string(),
            },
            "s9",
            lossy(),
        )
        .with_staff_token("tok");
        assert_eq!(
            viewer.rejoin_frames().await,
            vec![
                ClientFrame::JoinStaff {
                    token: "tok".to_string()
                },
                ClientFrame::JoinSession {
                    session_id: "s9".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn events_for_other_sessions_are_ignored() {
        let viewer = Viewer::new(ViewerKind::Customer, "s1", lossy());
        let event = ServerEvent::SessionResolved {
            session_id: "other".to_string(),
            message: "done".to_string(),
            resolved_by: "Lan".to_string(),
        };
        assert!(viewer.on_event(&event).await.is_none());
        assert!(viewer.resolved_notice().await.is_none());
    }
}
