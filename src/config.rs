use std::{env, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::types::StaffIdentity;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("malformed STAFF_TOKENS entry '{0}' (expected token:id:name[:role])")]
    StaffToken(String),
}

/// What happens to a customer message addressed to a resolved session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolvedPolicy {
    /// Mint a fresh session carrying the same customer info.
    #[default]
    Rotate,
    /// Refuse the message with a conflict.
    Reject,
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub openai: Option<OpenAiSettings>,
    pub bot_name: String,
    pub store_name: String,
    pub bot_persona: String,
    pub staff_tokens: Vec<(String, StaffIdentity)>,
    /// Product catalog used by viewers to hydrate product references.
    pub catalog_api_url: Option<String>,
    /// Defaults to the catalog URL.
    pub promotions_api_url: Option<String>,
    pub media_storage_dir: PathBuf,
    pub public_base_url: String,
    pub max_attachment_bytes: usize,
    pub max_message_chars: usize,
    pub resolved_policy: ResolvedPolicy,
    pub json_logs: bool,
    pub responder_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let port = parse_or(get("PORT"), "PORT", 4000u16)?;
        let openai = get("OPENAI_API_KEY").map(|api_key| OpenAiSettings {
            api_key,
            model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
        });
        let staff_tokens = match get("STAFF_TOKENS") {
            Some(raw) => parse_staff_tokens(&raw)?,
            None => Vec::new(),
        };
        let resolved_policy = match get("RESOLVED_SESSION_POLICY").as_deref() {
            None | Some("rotate") => ResolvedPolicy::Rotate,
            Some("reject") => ResolvedPolicy::Reject,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "RESOLVED_SESSION_POLICY",
                    value: other.to_string(),
                })
            }
        };
        let json_logs = match get("LOG_FORMAT").as_deref() {
            None | Some("text") | Some("pretty") => false,
            Some("json") => true,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "LOG_FORMAT",
                    value: other.to_string(),
                })
            }
        };

        let catalog_api_url = get("CATALOG_API_URL").map(|u| u.trim_end_matches('/').to_string());
        let promotions_api_url = get("PROMOTIONS_API_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .or_else(|| catalog_api_url.clone());

        Ok(Self {
            port,
            database_url: resolve_database_url(&get),
            openai,
            bot_name: get("BOT_NAME").unwrap_or_else(|| "Support Bot".to_string()),
            store_name: get("STORE_NAME").unwrap_or_else(|| "our store".to_string()),
            bot_persona: get("BOT_PERSONA").unwrap_or_default(),
            staff_tokens,
            catalog_api_url,
            promotions_api_url,
            media_storage_dir: get("MEDIA_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./media_uploads")),
            public_base_url: get("API_PUBLIC_URL")
                .unwrap_or_else(|| format!("http://localhost:{port}"))
                .trim_end_matches('/')
                .to_string(),
            max_attachment_bytes: parse_or(
                get("MAX_ATTACHMENT_BYTES"),
                "MAX_ATTACHMENT_BYTES",
                10 * 1024 * 1024,
            )?,
            max_message_chars: parse_or(get("MAX_MESSAGE_CHARS"), "MAX_MESSAGE_CHARS", 4000)?,
            resolved_policy,
            json_logs,
            responder_timeout: Duration::from_secs(parse_or(
                get("RESPONDER_TIMEOUT_SECS"),
                "RESPONDER_TIMEOUT_SECS",
                20u64,
            )?),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: None,
            openai: None,
            bot_name: "Support Bot".to_string(),
            store_name: "our store".to_string(),
            bot_persona: String::new(),
            staff_tokens: Vec::new(),
            catalog_api_url: None,
            promotions_api_url: None,
            media_storage_dir: PathBuf::from("./media_uploads"),
            public_base_url: "http://localhost:4000".to_string(),
            max_attachment_bytes: 10 * 1024 * 1024,
            max_message_chars: 4000,
            resolved_policy: ResolvedPolicy::Rotate,
            json_logs: false,
            responder_timeout: Duration::from_secs(20),
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// `DATABASE_URL` wins; otherwise a URL is assembled only when some
/// `POSTGRES_*`/`PG*` part is present. No database means the in-memory store.
fn resolve_database_url(get: &impl Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(url) = get("DATABASE_URL") {
        return Some(url);
    }
    let part = |primary: &str, fallback: &str| get(primary).or_else(|| get(fallback));
    let host = part("POSTGRES_HOST", "PGHOST")?;
    let port = part("POSTGRES_PORT", "PGPORT").unwrap_or_else(|| "5432".to_string());
    let user = part("POSTGRES_USER", "PGUSER").unwrap_or_else(|| "postgres".to_string());
    let password = part("POSTGRES_PASSWORD", "PGPASSWORD").unwrap_or_default();
    let db = part("POSTGRES_DB", "PGDATABASE").unwrap_or_else(|| "handoff".to_string());
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}

fn parse_staff_tokens(raw: &str) -> Result<Vec<(String, StaffIdentity)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts = entry.split(':').map(str::trim).collect::<Vec<_>>();
            match parts.as_slice() {
                [token, id, name] | [token, id, name, _] if !token.is_empty() && !id.is_empty() => {
                    Ok((
                        token.to_string(),
                        StaffIdentity {
                            id: id.to_string(),
                            name: name.to_string(),
                            role: parts.get(3).unwrap_or(&"staff").to_string(),
                        },
                    ))
                }
                _ => Err(ConfigError::StaffToken(entry.to_string())),
            }
        })
        .collect()
}
