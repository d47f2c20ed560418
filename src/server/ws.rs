//! HTTP front end of the relay.
//!
//! Every path other than `/health` is a topic: a WebSocket upgrade request
//! to `/{topic}` joins that topic's relay.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::relay::{ClientConnection, RelayHub};
use super::storage::TopicStorage;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router(hub: Arc<RelayHub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/{*topic}", get(ws_handler))
        .with_state(hub)
}

async fn ws_handler(
    State(hub): State<Arc<RelayHub>>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(_) => return (StatusCode::UPGRADE_REQUIRED, "Upgrade Required").into_response(),
    };
    if let Err(e) = TopicStorage::validate_topic(&topic) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    let Some(client_id) = headers
        .get("sec-websocket-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
    else {
        return (StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key").into_response();
    };

    ws.on_upgrade(move |socket| async move {
        match hub.connect(&topic, &client_id).await {
            Ok(connection) => handle_socket(socket, connection).await,
            Err(e) => error!(%topic, %e, "Failed to join topic"),
        }
    })
}

async fn handle_socket(socket: WebSocket, mut connection: ClientConnection) {
    let client_id = connection.client_id().to_string();
    debug!(topic = connection.topic(), %client_id, "Client connected");

    let (mut socket_sender, mut socket_receiver) = socket.split();
    let (outbound, mut outbound_receiver) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(payload) = outbound_receiver.recv().await {
            if socket_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
        let _ = socket_sender.close().await;
    });

    loop {
        tokio::select! {
            message = socket_receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        connection.send(text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%client_id, %e, "Failed to read ws::Message");
                        break;
                    }
                }
            }
            payload = connection.recv() => {
                let Some(payload) = payload else {
                    break;
                };
                if outbound.send(payload).is_err() {
                    break;
                }
            }
        }
    }

    debug!(topic = connection.topic(), %client_id, "Client disconnected");
    drop(outbound);
    let _ = writer.await;
}
