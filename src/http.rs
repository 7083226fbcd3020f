use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::{auth_staff_from_headers, StaffDirectory};
use crate::chat::ChatService;
use crate::error::ChatError;
use crate::hub::FanoutHub;
use crate::media::MediaStore;
use crate::registry::SessionRegistry;
use crate::types::{
    AiToggleBody, ChatMessage, HistoryQuery, NewSessionBody, PostMessageBody, PostOutcome,
    RequestStaffBody, Session, StaffIdentity, StaffMessageBody, StaffSessionsQuery,
};
use crate::ws::ws_handler;

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub chat: Arc<ChatService>,
    pub hub: Arc<FanoutHub>,
    pub staff_directory: Arc<dyn StaffDirectory>,
    pub media: Arc<dyn MediaStore>,
    pub max_attachment_bytes: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    // Multipart framing on top of the file itself.
    let upload_limit = state.max_attachment_bytes + 64 * 1024;
    Router::new()
        .route("/health", get(health))
        .route("/api/session", post(start_session))
        .route("/api/session/{session_id}", get(get_session))
        .route("/api/session/{session_id}/message", post(post_message))
        .route("/api/session/{session_id}/messages", get(get_history))
        .route("/api/session/{session_id}/request-staff", post(request_staff))
        .route("/api/session/{session_id}/accept", post(accept_session))
        .route("/api/session/{session_id}/resolve", post(resolve_session))
        .route("/api/session/{session_id}/ai", patch(set_ai_enabled))
        .route(
            "/api/session/{session_id}/staff-message",
            post(post_staff_message),
        )
        .route("/api/staff/sessions", get(list_staff_sessions))
        .route(
            "/api/uploads/attachment",
            post(upload_attachment).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/media/{file_name}", get(serve_stored_media))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": chrono::Utc::now().to_rfc3339() }))
}

/// Optional JSON body: an empty request means defaults.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ChatError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    json_body(body)
}

/// Required JSON body; parse failures use the same error envelope as every
/// other rejection.
fn json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ChatError> {
    serde_json::from_slice(body)
        .map_err(|err| ChatError::validation(format!("invalid request body: {err}")))
}

async fn require_staff(state: &AppState, headers: &HeaderMap) -> Result<StaffIdentity, ChatError> {
    auth_staff_from_headers(state.staff_directory.as_ref(), headers).await
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Session>), ChatError> {
    let body = optional_body::<NewSessionBody>(&body)?;
    let session = state.chat.start_session(body).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Session>, ChatError> {
    Ok(Json(state.registry.get(&session_id).await?))
}

async fn post_message(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<PostOutcome>, ChatError> {
    let body = json_body::<PostMessageBody>(&body)?;
    Ok(Json(state.chat.post_message(&session_id, body).await?))
}

async fn get_history(
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ChatMessage>>, ChatError> {
    Ok(Json(state.chat.history(&session_id, query.limit).await?))
}

async fn request_staff(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Session>, ChatError> {
    let body = optional_body::<RequestStaffBody>(&body)?;
    Ok(Json(
        state
            .registry
            .request_staff(&session_id, body.customer_info)
            .await?,
    ))
}

async fn accept_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Session>, ChatError> {
    let staff = require_staff(&state, &headers).await?;
    Ok(Json(state.registry.accept_session(&session_id, &staff).await?))
}

async fn resolve_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Session>, ChatError> {
    let staff = require_staff(&state, &headers).await?;
    Ok(Json(state.registry.resolve(&session_id, &staff).await?))
}

async fn set_ai_enabled(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Session>, ChatError> {
    let staff = require_staff(&state, &headers).await?;
    let body = json_body::<AiToggleBody>(&body)?;
    Ok(Json(
        state
            .registry
            .set_ai_enabled(&session_id, body.enabled, &staff)
            .await?,
    ))
}

async fn post_staff_message(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ChatMessage>), ChatError> {
    let staff = require_staff(&state, &headers).await?;
    let body = json_body::<StaffMessageBody>(&body)?;
    let message = state
        .chat
        .post_staff_message(&session_id, &staff, body)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn list_staff_sessions(
    Query(query): Query<StaffSessionsQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Session>>, ChatError> {
    let staff = require_staff(&state, &headers).await?;
    let filter = query.filter.unwrap_or_default();
    Ok(Json(state.registry.list_for_staff(filter, &staff.id).await?))
}

async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Response, ChatError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ChatError::validation(format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ChatError::validation(format!("attachment upload failed: {err}")))?;
        let attachment = state
            .media
            .upload(&file_name, &content_type, &bytes)
            .await?;
        return Ok((StatusCode::CREATED, Json(json!({ "attachment": attachment }))).into_response());
    }
    Err(ChatError::validation("missing file field in multipart form"))
}

async fn serve_stored_media(
    Path(file_name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ChatError> {
    let (bytes, content_type) = state
        .media
        .read(&file_name)
        .await?
        .ok_or_else(|| ChatError::NotFound("media file not found".to_string()))?;

    let mut response = Response::new(axum::body::Body::from(bytes));
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_bodies_become_validation_errors() {
        let err = json_body::<PostMessageBody>(&Bytes::from_static(b"{\"text\": 3}")).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(json_body::<AiToggleBody>(&Bytes::new()).is_err());

        let body = json_body::<PostMessageBody>(&Bytes::from_static(b"{\"text\": \"hi\"}")).unwrap();
        assert_eq!(body.text, "hi");
        assert!(optional_body::<NewSessionBody>(&Bytes::from_static(b"  ")).is_ok());
    }
}
