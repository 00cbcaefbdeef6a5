//! WebSocket endpoint
//!
//! Authentication happens at the handshake: the caller resolver has
//! already run, and a `token`/`apikey` query parameter is accepted as a
//! fallback for browser WebSocket clients that cannot set headers. The
//! Principal is captured into the connection for the life of the socket.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Extension, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::principal::Principal;
use crate::realtime::{Channel, ClientMessage, ServerMessage};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub apikey: Option<String>,
}

/// Upgrade handler for `/api/v1/realtime`
pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    // Query-parameter credentials take over only when the headers carried
    // nothing; an invalid query token is as fatal as an invalid header.
    let query_token = query.token.or(query.apikey);
    let anon_ip = match &principal {
        Principal::Anonymous { ip } => Some(ip.clone()),
        _ => None,
    };

    let principal = match (anon_ip, query_token) {
        (Some(ip), Some(token)) => {
            let claims = state.tokens.verify(&token).await?;
            match claims.user_id() {
                Some(user_id) if claims.session_id.is_some() => Principal::User {
                    user_id,
                    role: claims.role.clone(),
                    session_id: claims.session_id,
                    claims: Box::new(claims),
                },
                _ if claims.role == "service_role" => Principal::Service {
                    key_id: claims.user_id().unwrap_or_default(),
                    scopes: vec!["*".to_string()],
                },
                _ => Principal::Anonymous { ip },
            }
        }
        _ => principal,
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(state, principal, socket)))
}

async fn handle_socket(state: Arc<AppState>, principal: Principal, socket: WebSocket) {
    let (conn, mut outbound, mut close_rx) = state.hub.register(principal);
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: drains the bounded queue; frames for one connection
    // are delivered in the order the hub enqueued them.
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                message = outbound.recv() => {
                    match message {
                        Some(message) => {
                            let Ok(json) = serde_json::to_string(&message) else {
                                continue;
                            };
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                code = close_rx.recv() => {
                    if let Some(code) = code {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: close_reason(code).into(),
                            })))
                            .await;
                    }
                    break;
                }
            }
        }
    });

    // Reader loop: one frame at a time from this client
    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => break,
        };

        match frame {
            Message::Text(text) => {
                let parsed: std::result::Result<ClientMessage, _> =
                    serde_json::from_str(text.as_str());
                match parsed {
                    Ok(message) => handle_client_message(&state, &conn, message).await,
                    Err(_) => {
                        send_status(&conn, "error", None, Some("unreadable frame".into())).await;
                    }
                }
            }
            Message::Close(_) => break,
            // Pings are answered by axum automatically
            _ => {}
        }
    }

    state.hub.unregister(conn.id);
    writer.abort();
    tracing::debug!(connection = %conn.id, "websocket closed");
}

async fn handle_client_message(
    state: &Arc<AppState>,
    conn: &Arc<crate::realtime::ConnectionState>,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Subscribe { channel, filter } => {
            match state.hub.subscribe(conn, &channel, filter.as_deref()).await {
                Ok(()) => {
                    send_status(conn, "subscribed", Some(&channel), None).await;
                }
                Err(err) => {
                    let status = subscribe_failure_status(&err);
                    send_status(conn, status, Some(&channel), Some(err.to_string())).await;
                }
            }
        }
        ClientMessage::Unsubscribe { channel } => {
            state.hub.unsubscribe(conn, &channel);
            send_status(conn, "unsubscribed", Some(&channel), None).await;
        }
        ClientMessage::Broadcast {
            channel,
            event,
            payload,
        } => {
            if let Err(err) = state
                .hub
                .client_broadcast(conn, &channel, &event, payload)
                .await
            {
                send_status(conn, "error", Some(&channel), Some(err.to_string())).await;
            }
        }
    }
}

/// Status values for rejected subscriptions, per the frame protocol
fn subscribe_failure_status(err: &Error) -> &'static str {
    match err {
        Error::NotFound(_) => "unknown_channel",
        Error::BadRequest(_) => "bad_filter",
        _ => "unauthorized",
    }
}

async fn send_status(
    conn: &Arc<crate::realtime::ConnectionState>,
    status: &str,
    channel: Option<&str>,
    reason: Option<String>,
) {
    let channel = channel.and_then(|name| Channel::parse(name).ok());
    let message = ServerMessage::status(status, channel.as_ref(), reason);
    // Status frames ride the same bounded queue as everything else
    let _ = conn.send(message).await;
}

fn close_reason(code: u16) -> &'static str {
    match code {
        crate::realtime::CLOSE_UNAUTHORIZED => "unauthorized",
        crate::realtime::CLOSE_FORBIDDEN => "forbidden",
        crate::realtime::CLOSE_SLOW_CLIENT => "slow client",
        crate::realtime::CLOSE_POLICY => "policy violation",
        _ => "closed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_failure_statuses() {
        assert_eq!(
            subscribe_failure_status(&Error::NotFound("x".into())),
            "unknown_channel"
        );
        assert_eq!(
            subscribe_failure_status(&Error::BadRequest("x".into())),
            "bad_filter"
        );
        assert_eq!(
            subscribe_failure_status(&Error::Forbidden("x".into())),
            "unauthorized"
        );
    }

    #[test]
    fn test_close_reasons() {
        assert_eq!(close_reason(4004), "slow client");
        assert_eq!(close_reason(4008), "policy violation");
        assert_eq!(close_reason(1000), "closed");
    }
}
