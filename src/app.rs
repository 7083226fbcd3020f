use std::sync::Arc;

use crate::auth::StaticStaffDirectory;
use crate::chat::{ChatService, ChatSettings};
use crate::config::Config;
use crate::http::{router, AppState};
use crate::hub::FanoutHub;
use crate::media::LocalMediaStore;
use crate::registry::SessionRegistry;
use crate::responder::{OpenAiResponder, Responder, RuleResponder};
use crate::store::{MemoryStore, MessageStore, PgStore, SessionStore};
use crate::telemetry::init_tracing;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub async fn run() -> Result<(), BoxError> {
    let config = Config::from_env()?;
    init_tracing(config.json_logs)?;

    let state = build_state(&config).await?;
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(port = config.port, "handoff server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("handoff server stopped");
    Ok(())
}

pub async fn build_state(config: &Config) -> Result<Arc<AppState>, BoxError> {
    let hub = Arc::new(FanoutHub::new());

    let (sessions, messages): (Arc<dyn SessionStore>, Arc<dyn MessageStore>) =
        match &config.database_url {
            Some(url) => {
                let store = Arc::new(PgStore::connect(url).await?);
                tracing::info!("using postgres store");
                (
                    store.clone() as Arc<dyn SessionStore>,
                    store as Arc<dyn MessageStore>,
                )
            }
            None => {
                tracing::warn!("no database configured; sessions live in memory only");
                let store = Arc::new(MemoryStore::new());
                (
                    store.clone() as Arc<dyn SessionStore>,
                    store as Arc<dyn MessageStore>,
                )
            }
        };

    let responder: Arc<dyn Responder> = match &config.openai {
        Some(settings) => {
            tracing::info!(model = %settings.model, "using openai responder");
            Arc::new(OpenAiResponder::new(
                reqwest::Client::new(),
                settings.clone(),
                &config.store_name,
                &config.bot_name,
                &config.bot_persona,
                config.responder_timeout,
            ))
        }
        None => {
            tracing::info!("OPENAI_API_KEY not set; using rule responder");
            Arc::new(RuleResponder::new(&config.bot_name))
        }
    };

    let registry = Arc::new(SessionRegistry::new(sessions, hub.clone()));
    let chat = Arc::new(ChatService::new(
        registry.clone(),
        messages,
        hub.clone(),
        responder,
        ChatSettings::from(config),
    ));

    let media = LocalMediaStore::new(
        &config.media_storage_dir,
        &config.public_base_url,
        config.max_attachment_bytes,
    );
    media.ensure_dir().await?;

    let staff_directory = StaticStaffDirectory::new(config.staff_tokens.clone());
    if staff_directory.is_empty() {
        tracing::warn!("STAFF_TOKENS is empty; staff routes will reject every request");
    }

    Ok(Arc::new(AppState {
        registry,
        chat,
        hub,
        staff_directory: Arc::new(staff_directory),
        media: Arc::new(media),
        max_attachment_bytes: config.max_attachment_bytes,
    }))
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
