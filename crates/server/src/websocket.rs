//! WebSocket event feed. Subscribers receive the engine's live event
//! stream; delivery over this channel is best-effort (the durable log
//! is the source of truth), and consumers de-duplicate by run, node,
//! and status.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::config::AppState;

/// Client subscription request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WsRequest {
    /// Receive events for every run
    SubscribeAll,
    /// Receive events for one run only
    SubscribeRun { run_id: String },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsReply {
    Subscribed { scope: String },
    Lagged { skipped: u64 },
    Pong,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.engine.subscribe();
    // None = all runs
    let mut filter: Option<String> = None;

    if let Ok(reply) = serde_json::to_string(&WsReply::Subscribed {
        scope: "all".to_string(),
    }) {
        let _ = sink.send(Message::Text(reply.into())).await;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(run_id) = &filter {
                        if event.run_id.to_string() != *run_id {
                            continue;
                        }
                    }
                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            if sink.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("failed to serialize event: {e}"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("websocket subscriber lagged, skipped {skipped} events");
                    if let Ok(reply) = serde_json::to_string(&WsReply::Lagged { skipped }) {
                        let _ = sink.send(Message::Text(reply.into())).await;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<WsRequest>(&text) {
                        Ok(WsRequest::SubscribeAll) => {
                            filter = None;
                            if let Ok(reply) = serde_json::to_string(&WsReply::Subscribed {
                                scope: "all".to_string(),
                            }) {
                                let _ = sink.send(Message::Text(reply.into())).await;
                            }
                        }
                        Ok(WsRequest::SubscribeRun { run_id }) => {
                            if let Ok(reply) = serde_json::to_string(&WsReply::Subscribed {
                                scope: run_id.clone(),
                            }) {
                                let _ = sink.send(Message::Text(reply.into())).await;
                            }
                            filter = Some(run_id);
                        }
                        Ok(WsRequest::Ping) => {
                            if let Ok(reply) = serde_json::to_string(&WsReply::Pong) {
                                let _ = sink.send(Message::Text(reply.into())).await;
                            }
                        }
                        Err(e) => tracing::debug!("ignoring malformed ws request: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("websocket receive error: {e}");
                    break;
                }
            },
        }
    }
}
