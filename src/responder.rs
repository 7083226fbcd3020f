//! The automated assistant seam. The chat service treats it as opaque:
//! given the latest customer message it yields at most one reply and may ask
//! for a human instead.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::OpenAiSettings;
use crate::prompting::{render_system_prompt, SystemPromptContext};
use crate::types::{ChatMessage, Sender, Session};

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("responder request failed: {0}")]
    Transport(String),

    #[error("responder returned an unusable answer: {0}")]
    Malformed(String),
}

pub struct ResponderRequest<'a> {
    pub session: &'a Session,
    pub text: &'a str,
    /// Recent messages, oldest first, including the one being answered.
    pub transcript: &'a [ChatMessage],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponderOutcome {
    pub reply: Option<String>,
    pub handover: bool,
}

#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, request: &ResponderRequest<'_>)
        -> Result<ResponderOutcome, ResponderError>;
}

pub fn has_handover_intent(text: &str) -> bool {
    let lower = text.to_lowercase();
    let terms = [
        "human",
        "real person",
        "representative",
        "live agent",
        "talk to staff",
        "talk to agent",
        "speak to agent",
        "speak with agent",
        "nhân viên",
        "tư vấn viên",
        "người thật",
        "gặp người",
    ];
    terms.iter().any(|needle| lower.contains(needle))
}

fn is_greeting(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    ["xin chào", "chào", "hello", "hi", "hey"]
        .iter()
        .any(|g| lower == *g || lower.starts_with(&format!("{g} ")) || lower.starts_with(&format!("{g}!")))
}

/// Keyword assistant used when no model is configured.
pub struct RuleResponder {
    bot_name: String,
}

impl RuleResponder {
    pub fn new(bot_name: &str) -> Self {
        Self {
            bot_name: bot_name.to_string(),
        }
    }
}

#[async_trait]
impl Responder for RuleResponder {
    async fn respond(
        &self,
        request: &ResponderRequest<'_>,
    ) -> Result<ResponderOutcome, ResponderError> {
        if has_handover_intent(request.text) {
            return Ok(ResponderOutcome {
                reply: None,
                handover: true,
            });
        }
        let reply = if is_greeting(request.text) {
            let name = request
                .session
                .customer_info
                .as_ref()
                .and_then(|c| c.name.as_deref());
            match name {
                Some(name) => format!("Xin chào {name}! {} có thể giúp gì cho bạn?", self.bot_name),
                None => format!("Xin chào! {} có thể giúp gì cho bạn?", self.bot_name),
            }
        } else {
            "Thanks for your message! Ask me about any product, or say \"talk to staff\" to reach a person."
                .to_string()
        };
        Ok(ResponderOutcome {
            reply: Some(reply),
            handover: false,
        })
    }
}

pub struct OpenAiResponder {
    client: reqwest::Client,
    settings: OpenAiSettings,
    store_name: String,
    bot_name: String,
    bot_persona: String,
    timeout: Duration,
}

impl OpenAiResponder {
    pub fn new(
        client: reqwest::Client,
        settings: OpenAiSettings,
        store_name: &str,
        bot_name: &str,
        bot_persona: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            settings,
            store_name: store_name.to_string(),
            bot_name: bot_name.to_string(),
            bot_persona: bot_persona.to_string(),
            timeout,
        }
    }

    async fn chat_completion_text(&self, system: &str, messages: Vec<Value>) -> Result<String, ResponderError> {
        let mut all = vec![json!({ "role": "system", "content": system })];
        all.extend(messages);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.settings.base_url))
            .bearer_auth(&self.settings.api_key)
            .timeout(self.timeout)
            .json(&json!({
                "model": self.settings.model,
                "messages": all,
                "temperature": 0.2
            }))
            .send()
            .await
            .map_err(|err| ResponderError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ResponderError::Transport(format!("openai returned {status}: {body}")));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| ResponderError::Malformed(err.to_string()))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(ResponderError::Malformed("empty content".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl Responder for OpenAiResponder {
    async fn respond(
        &self,
        request: &ResponderRequest<'_>,
    ) -> Result<ResponderOutcome, ResponderError> {
        if has_handover_intent(request.text) {
            return Ok(ResponderOutcome {
                reply: None,
                handover: true,
            });
        }
        let system = render_system_prompt(&SystemPromptContext {
            store_name: &self.store_name,
            bot_name: &self.bot_name,
            bot_persona: &self.bot_persona,
            customer_name: request
                .session
                .customer_info
                .as_ref()
                .and_then(|c| c.name.as_deref()),
        });
        let messages = request
            .transcript
            .iter()
            .map(|message| {
                let role = match message.sender {
                    Sender::User => "user",
                    Sender::Bot | Sender::Staff { .. } => "assistant",
                };
                json!({ "role": role, "content": message.text })
            })
            .collect::<Vec<_>>();

        let raw = self.chat_completion_text(&system, messages).await?;
        Ok(parse_decision(&raw).unwrap_or(ResponderOutcome {
            reply: Some(raw),
            handover: false,
        }))
    }
}

/// Accepts bare JSON, fenced JSON, or JSON embedded in prose.
pub fn parse_decision(raw: &str) -> Option<ResponderOutcome> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut candidates = vec![trimmed.to_string()];
    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
        if !stripped.is_empty() {
            candidates.push(stripped);
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    for candidate in candidates {
        let Ok(parsed) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };
        let reply = parsed
            .get("reply")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        let handover = parsed
            .get("handover")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if reply.is_none() && !handover {
            continue;
        }
        return Some(ResponderOutcome { reply, handover });
    }

    None
}
