//! Message posting: the path a customer or agent message takes from the
//! request to the store, the room and (for customers) the assistant.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use uuid::Uuid;

use crate::config::{Config, ResolvedPolicy};
use crate::error::ChatError;
use crate::hub::FanoutHub;
use crate::registry::SessionRegistry;
use crate::responder::{Responder, ResponderOutcome, ResponderRequest};
use crate::store::MessageStore;
use crate::types::{
    ChatMessage, NewSessionBody, PostMessageBody, PostOutcome, Sender, ServerEvent, Session,
    SessionStatus, StaffIdentity, StaffMessageBody,
};
use crate::validation::{validate_outgoing, validate_session_id};

/// Messages handed to the assistant as context.
pub const RESPONDER_CONTEXT_MESSAGES: usize = 14;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 200;

const FALLBACK_REPLY: &str =
    "Sorry, I can't answer that right now. Say \"talk to staff\" and a team member will help you.";

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub max_message_chars: usize,
    pub resolved_policy: ResolvedPolicy,
    pub responder_timeout: Duration,
}

impl From<&Config> for ChatSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_message_chars: config.max_message_chars,
            resolved_policy: config.resolved_policy,
            responder_timeout: config.responder_timeout,
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

pub struct ChatService {
    registry: Arc<SessionRegistry>,
    messages: Arc<dyn MessageStore>,
    hub: Arc<FanoutHub>,
    responder: Arc<dyn Responder>,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        messages: Arc<dyn MessageStore>,
        hub: Arc<FanoutHub>,
        responder: Arc<dyn Responder>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            registry,
            messages,
            hub,
            responder,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Mints a fresh session id. Customer info falls back to whatever the
    /// previous session knew.
    pub async fn start_session(&self, body: NewSessionBody) -> Result<Session, ChatError> {
        let mut customer_info = body.customer_info;
        if customer_info.is_none() {
            if let Some(previous) = body.previous_session_id.as_deref() {
                customer_info = match self.registry.get(previous).await {
                    Ok(session) => session.customer_info,
                    Err(ChatError::SessionNotFound(_)) => None,
                    Err(err) => return Err(err),
                };
            }
        }
        let session_id = Uuid::new_v4().to_string();
        let session = self
            .registry
            .ensure_session(&session_id, customer_info)
            .await?;
        if let Some(previous) = body.previous_session_id {
            tracing::info!(session_id, previous_session_id = %previous, "session reset");
        }
        Ok(session)
    }

    pub async fn post_message(
        &self,
        session_id: &str,
        post: PostMessageBody,
    ) -> Result<PostOutcome, ChatError> {
        let session_id = validate_session_id(session_id)?;
        let text = post.text.trim().to_string();
        validate_outgoing(&text, post.attachment.as_ref(), self.settings.max_message_chars)?;

        let mut guard = self.registry.lock_session(session_id).await;
        let mut session = self
            .registry
            .ensure_session(session_id, post.customer_info.clone())
            .await?;

        if session.status == SessionStatus::Resolved {
            match self.settings.resolved_policy {
                ResolvedPolicy::Reject => {
                    return Err(ChatError::SessionResolved(session.session_id));
                }
                ResolvedPolicy::Rotate => {
                    let fresh_id = Uuid::new_v4().to_string();
                    drop(guard);
                    guard = self.registry.lock_session(&fresh_id).await;
                    let info = post.customer_info.clone().or(session.customer_info.clone());
                    tracing::info!(
                        previous_session_id = %session.session_id,
                        session_id = %fresh_id,
                        "message to resolved session rotated"
                    );
                    session = self.registry.ensure_session(&fresh_id, info).await?;
                }
            }
        }
        let session_id = session.session_id.clone();

        let now = Utc::now();
        let user_message = self
            .messages
            .append(ChatMessage {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                sender: Sender::User,
                text: text.clone(),
                attachment: post.attachment,
                client_message_id: post.client_message_id.clone(),
                created_at: now,
            })
            .await?;
        self.hub
            .broadcast(&session_id, &ServerEvent::NewMessage(user_message.clone()))
            .await;
        let session = self.registry.touch(&session_id, now).await?;
        drop(guard);

        let mut outcome = PostOutcome {
            session_id: session_id.clone(),
            user_message,
            bot_message: None,
            escalated: false,
            client_message_id: post.client_message_id,
        };
        if session.status != SessionStatus::Ai {
            return Ok(outcome);
        }

        let decision = self.ask_responder(&session, &text).await;
        if decision.handover {
            self.registry.request_staff(&session_id, None).await?;
            outcome.escalated = true;
            return Ok(outcome);
        }

        let reply = decision
            .reply
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_REPLY.to_string());
        outcome.bot_message = self.append_bot_reply(&session_id, reply).await?;
        Ok(outcome)
    }

    async fn ask_responder(&self, session: &Session, text: &str) -> ResponderOutcome {
        let transcript = match self
            .messages
            .history(&session.session_id, RESPONDER_CONTEXT_MESSAGES)
            .await
        {
            Ok(transcript) => transcript,
            Err(err) => {
                tracing::warn!(session_id = %session.session_id, error = %err, "transcript unavailable for responder");
                Vec::new()
            }
        };
        let request = ResponderRequest {
            session,
            text,
            transcript: &transcript,
        };
        match tokio::time::timeout(self.settings.responder_timeout, self.responder.respond(&request))
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                tracing::warn!(session_id = %session.session_id, error = %err, "responder failed");
                ResponderOutcome::default()
            }
            Err(_) => {
                tracing::warn!(session_id = %session.session_id, "responder timed out");
                ResponderOutcome::default()
            }
        }
    }

    /// Appends the reply only if nobody took the session away from the
    /// assistant while it was thinking.
    async fn append_bot_reply(
        &self,
        session_id: &str,
        reply: String,
    ) -> Result<Option<ChatMessage>, ChatError> {
        let _guard = self.registry.lock_session(session_id).await;
        let current = self.registry.get(session_id).await?;
        if current.status != SessionStatus::Ai {
            tracing::debug!(session_id, status = %current.status, "bot reply dropped");
            return Ok(None);
        }
        let now = Utc::now();
        let bot_message = self
            .messages
            .append(ChatMessage {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                sender: Sender::Bot,
                text: reply,
                attachment: None,
                client_message_id: None,
                created_at: now,
            })
            .await?;
        self.hub
            .broadcast(session_id, &ServerEvent::NewMessage(bot_message.clone()))
            .await;
        self.registry.touch(session_id, now).await?;
        Ok(Some(bot_message))
    }

    pub async fn post_staff_message(
        &self,
        session_id: &str,
        staff: &StaffIdentity,
        post: StaffMessageBody,
    ) -> Result<ChatMessage, ChatError> {
        let session_id = validate_session_id(session_id)?;
        let text = post.text.trim().to_string();
        let has_product = post.product_data.is_some();
        if !(has_product && text.is_empty() && post.attachment.is_none()) {
            validate_outgoing(&text, post.attachment.as_ref(), self.settings.max_message_chars)?;
        }

        let _guard = self.registry.lock_session(session_id).await;
        let session = self.registry.get(session_id).await?;
        if session.status == SessionStatus::Resolved {
            return Err(ChatError::SessionResolved(session.session_id));
        }
        if !session.is_assigned_to(&staff.id) {
            return Err(ChatError::NotAssigned);
        }

        let now = Utc::now();
        let message = self
            .messages
            .append(ChatMessage {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                sender: Sender::Staff {
                    staff_id: staff.id.clone(),
                    staff_name: staff.name.clone(),
                    product_data: post.product_data,
                },
                text,
                attachment: post.attachment,
                client_message_id: post.client_message_id,
                created_at: now,
            })
            .await?;
        self.hub
            .broadcast(session_id, &ServerEvent::NewMessage(message.clone()))
            .await;
        self.registry.touch(session_id, now).await?;
        Ok(message)
    }

    pub async fn history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.messages.history(session_id, limit).await?)
    }
}
