//! Live order updates over WebSocket.
//!
//! Clients authenticate during the handshake with the same bearer session
//! as the REST API (`Authorization` header, or `?token=` for browsers that
//! cannot set headers on a WebSocket). Frames are JSON:
//!
//! ```text
//! server -> client  {"event": "payment_update", "data": { ...order... }}
//! client -> server  {"event": "join_order_room", "data": {"orderId": 42}}
//! ```

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::extract::Query;
use crate::middleware::auth::{AuthError, Credential, Principal, authorize};
use crate::models::SessionUser;
use crate::services::notify::{ClientMessage, ConnectionId};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
}

/// `GET /ws`
pub async fn connect(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
) -> Result<Response> {
    let credential = Credential::from_headers(&headers)
        .or_else(|| {
            query
                .token
                .filter(|token| !token.trim().is_empty())
                .map(|token| Credential::Session(SecretString::from(token)))
        })
        .ok_or(AuthError::MissingCredential)?;

    let principal = authorize(
        state.stores().sessions.as_ref(),
        state.config().legacy_admin_token.as_ref(),
        credential,
        Utc::now(),
    )
    .await?;
    let Principal::User(user) = principal else {
        return Err(AuthError::Forbidden(
            "live updates require a user session".to_string(),
        )
        .into());
    };

    Ok(ws.on_upgrade(move |socket| serve_connection(state, user, socket)))
}

async fn serve_connection(state: AppState, user: SessionUser, socket: WebSocket) {
    let (id, mut events) = state.notifier().register(&user);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(connection = %id, error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(&state, &user, id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    state.notifier().unregister(id);
}

async fn handle_client_message(state: &AppState, user: &SessionUser, id: ConnectionId, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(connection = %id, error = %e, "Ignoring malformed client message");
            return;
        }
    };

    match message {
        ClientMessage::JoinOrderRoom { order_id } => {
            // Customers may only follow their own orders
            if state.coordinator().order_for(user, order_id).await.is_err() {
                debug!(connection = %id, %order_id, "Refused order room join");
                return;
            }
            state.notifier().join_order_room(id, order_id);
        }
        ClientMessage::LeaveOrderRoom { order_id } => {
            state.notifier().leave_order_room(id, order_id);
        }
    }
}
