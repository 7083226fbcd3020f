use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};

use crate::http::AppState;
use crate::hub::ConnectionId;
use crate::types::{ClientFrame, ServerEvent};
use crate::validation::validate_session_id;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (client_id, mut rx) = state.hub.register().await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        handle_text(&state, client_id, &text).await;
    }

    state.hub.disconnect(client_id).await;
    send_task.abort();
}

async fn handle_text(state: &AppState, client_id: ConnectionId, text: &str) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => handle_frame(state, client_id, frame).await,
        Err(err) => {
            tracing::debug!(connection_id = client_id, error = %err, "unrecognized frame");
            reject(state, client_id, "unrecognized frame").await;
        }
    }
}

async fn handle_frame(state: &AppState, client_id: ConnectionId, frame: ClientFrame) {
    match frame {
        ClientFrame::JoinSession { session_id } => {
            if let Err(err) = validate_session_id(&session_id) {
                reject(state, client_id, &err.to_string()).await;
                return;
            }
            state.hub.join(client_id, &session_id).await;
            // Lets a reconnecting client catch up on status it missed.
            if let Ok(session) = state.registry.get(&session_id).await {
                state
                    .hub
                    .send_to_client(client_id, &ServerEvent::SessionUpdate(session))
                    .await;
            }
        }
        ClientFrame::LeaveSession { session_id } => {
            state.hub.leave(client_id, &session_id).await;
        }
        ClientFrame::JoinStaff { token } => {
            match state.staff_directory.current_user(&token).await {
                Some(staff) => {
                    state.hub.join_staff(client_id).await;
                    tracing::info!(connection_id = client_id, staff_id = %staff.id, "staff joined realtime channel");
                }
                None => {
                    tracing::warn!(connection_id = client_id, "staff join with invalid token");
                    reject(state, client_id, "invalid staff token").await;
                }
            }
        }
        ClientFrame::Ping => {}
    }
}

async fn reject(state: &AppState, client_id: ConnectionId, message: &str) {
    state
        .hub
        .send_to_client(
            client_id,
            &ServerEvent::Error {
                message: message.to_string(),
            },
        )
        .await;
}
