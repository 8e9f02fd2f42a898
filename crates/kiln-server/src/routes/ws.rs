//! WebSocket endpoint.
//!
//! Authenticated by a `token` query parameter. After accept the server
//! sends `connection:established`, answers `ping` with `pong`, and
//! forwards the tenant's state-change events from the hub. Invalid
//! tokens are closed with policy-violation code 1008.

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use kiln_core::token::{self, Claims};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> impl IntoResponse {
    let claims = params
        .token
        .as_deref()
        .and_then(|t| token::validate_token(&state.token_config, t).ok());

    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, claims: Option<Claims>) {
    let Some(claims) = claims else {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "Invalid token".into(),
            })))
            .await;
        return;
    };

    let established = json!({
        "event": "connection:established",
        "data": {
            "user_id": claims.user_id,
            "tenant_id": claims.tenant_id,
            "role": claims.role,
        },
    });
    if send_json(&mut socket, &established).await.is_err() {
        return;
    }

    let mut subscription = state.hub.subscribe(claims.tenant_id);
    tracing::info!(
        tenant_id = %claims.tenant_id,
        user_id = %claims.user_id,
        "websocket connected"
    );

    loop {
        tokio::select! {
            // Fan-out from the tenant hub.
            event = subscription.rx.recv() => {
                let Some(event) = event else { break };
                let payload = json!({ "event": event.event, "data": event.data });
                if send_json(&mut socket, &payload).await.is_err() {
                    break;
                }
            }
            // Client messages.
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                            if value.get("event").and_then(|e| e.as_str()) == Some("ping") {
                                let pong = json!({
                                    "event": "pong",
                                    "data": value.get("data").cloned().unwrap_or(json!(null)),
                                });
                                if send_json(&mut socket, &pong).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unsubscribe(claims.tenant_id, subscription.id);
    tracing::info!(
        tenant_id = %claims.tenant_id,
        user_id = %claims.user_id,
        "websocket disconnected"
    );
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}
