//! The websocket endpoint: authenticate the upgrade, register the
//! connection, then pump frames between the wire and the chat service
//! until the peer leaves or the liveness monitor gives up on it.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::Utc;
use crewline_core::{decode_client_frame, InboundFrame, PresenceStatus, ServerFrame};
use serde::Deserialize;
use tokio::time::timeout;

use crate::auth::{bearer_token, AuthError};
use crate::chat::ChatService;
use crate::registry::{Connection, Outbound};
use crate::AppState;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct RealtimeQuery {
    pub token: Option<String>,
}

pub async fn realtime_socket(
    State(state): State<AppState>,
    Query(query): Query<RealtimeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let permit = match state.connection_permits().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => return Err(StatusCode::TOO_MANY_REQUESTS),
    };

    let verified = match bearer_token(query.token.as_deref(), &headers) {
        None => Err(AuthError::MissingToken),
        Some(token) => state.verifier().verify(token),
    };
    if let Err(reason) = &verified {
        // Never log the credential itself.
        tracing::warn!(%reason, "websocket authentication failed");
    }

    let chat = state.chat();
    Ok(ws.on_upgrade(move |socket| async move {
        let _permit = permit;
        match verified {
            Ok(identity) => {
                run_connection(chat, socket, identity).await;
            }
            Err(_) => reject_socket(socket).await,
        }
    }))
}

/// Close an unauthenticated socket with a policy-violation code before any
/// frame is processed.
async fn reject_socket(mut socket: WebSocket) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "authentication failed".into(),
        })))
        .await;
}

pub(crate) async fn run_connection(
    chat: Arc<ChatService>,
    mut socket: WebSocket,
    identity: crate::auth::Identity,
) {
    let registry = chat.registry().clone();
    let (conn, mut outbound) = Connection::open(identity);

    if let Some(previous) = registry.register(conn.clone()).await {
        // Latest connection wins; the stale socket closes without an
        // offline broadcast since the user stays reachable.
        tracing::debug!(user_id = %conn.user_id, "replacing existing connection for user");
        previous.request_close();
    }

    conn.push(ServerFrame::ConnectionEstablished {
        user_id: conn.user_id,
        timestamp: Utc::now(),
    });
    if let Err(err) = chat
        .broadcast_status(conn.user_id, conn.tenant_id, PresenceStatus::Online)
        .await
    {
        tracing::warn!(?err, user_id = %conn.user_id, "failed to broadcast online presence");
    }
    tracing::info!(
        user_id = %conn.user_id,
        tenant_id = %conn.tenant_id,
        role = %conn.role,
        "websocket connected"
    );

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                match queued {
                    Some(Outbound::Frame(frame)) => {
                        let send = socket.send(WsMessage::Text(frame.to_json().into()));
                        match timeout(SEND_TIMEOUT, send).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                tracing::debug!(?err, user_id = %conn.user_id, "websocket send failed");
                                break;
                            }
                            Err(_) => {
                                tracing::warn!(user_id = %conn.user_id, "websocket send timed out");
                                break;
                            }
                        }
                    }
                    Some(Outbound::Probe) => {
                        if socket.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = socket.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(&chat, &conn, text.as_str()).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => conn.mark_alive(),
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(?err, user_id = %conn.user_id, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    if registry.remove_if_current(&conn).await {
        if let Err(err) = chat
            .broadcast_status(conn.user_id, conn.tenant_id, PresenceStatus::Offline)
            .await
        {
            tracing::warn!(?err, user_id = %conn.user_id, "failed to broadcast offline presence");
        }
        tracing::info!(user_id = %conn.user_id, "websocket disconnected");
    }
}

async fn handle_frame(chat: &ChatService, conn: &Connection, raw: &str) {
    match decode_client_frame(raw) {
        Ok(InboundFrame::Command(command)) => {
            if let Err(err) = chat.handle_command(conn, command).await {
                tracing::warn!(?err, user_id = %conn.user_id, "command handler failed");
                conn.push(ServerFrame::error("internal error"));
            }
        }
        Ok(InboundFrame::Unknown(tag)) => {
            tracing::debug!(frame_type = %tag, user_id = %conn.user_id, "ignoring unknown frame type");
        }
        Err(err) => {
            tracing::debug!(%err, user_id = %conn.user_id, "malformed frame");
            conn.push(ServerFrame::error("malformed frame"));
        }
    }
}
