use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::error::ChatError;
use crate::types::StaffIdentity;

/// Resolves a staff bearer token to the agent behind it.
#[async_trait]
pub trait StaffDirectory: Send + Sync {
    async fn current_user(&self, token: &str) -> Option<StaffIdentity>;
}

/// Fixed token table, loaded from `STAFF_TOKENS`.
#[derive(Debug, Default, Clone)]
pub struct StaticStaffDirectory {
    tokens: HashMap<String, StaffIdentity>,
}

impl StaticStaffDirectory {
    pub fn new(entries: impl IntoIterator<Item = (String, StaffIdentity)>) -> Self {
        Self {
            tokens: entries.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl StaffDirectory for StaticStaffDirectory {
    async fn current_user(&self, token: &str) -> Option<StaffIdentity> {
        self.tokens.get(token.trim()).cloned()
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

pub async fn auth_staff_from_headers(
    directory: &dyn StaffDirectory,
    headers: &HeaderMap,
) -> Result<StaffIdentity, ChatError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ChatError::Unauthorized("missing bearer token".to_string()))?;
    directory
        .current_user(&token)
        .await
        .ok_or_else(|| ChatError::Unauthorized("invalid token".to_string()))
}
