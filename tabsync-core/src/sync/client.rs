//! WebSocket transport to a relay.
//!
//! Each text frame is one payload. The relay addresses inbound frames with
//! the sender's client id and reads the recipient from outbound ones.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::error::SyncError;
use super::synchronizer::Transport;

/// Builds the WebSocket URL for a topic on a relay.
///
/// `http(s)://` becomes `ws(s)://`; a bare host gets `ws://`.
pub fn build_ws_url(server_url: &str, topic: &str) -> String {
    let base_url = if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if !server_url.starts_with("ws://") && !server_url.starts_with("wss://") {
        format!("ws://{server_url}")
    } else {
        server_url.to_string()
    };

    format!("{}/{}", base_url.trim_end_matches('/'), topic.trim_start_matches('/'))
}

/// Connects to `url` and returns a transport over the socket.
///
/// The transport's inbound side closes when the socket does.
pub async fn connect(url: &str) -> Result<Transport, SyncError> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
    debug!(url, "Connected to relay");

    let (mut sender, mut receiver) = ws_stream.split();
    let (outbound, mut outgoing) = mpsc::unbounded_channel::<String>();
    let (incoming, inbound) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(payload) = outgoing.recv().await {
            if let Err(e) = sender.send(Message::Text(payload.into())).await {
                warn!(error = %e, "Failed to send to relay");
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if incoming.send(text.to_string()).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Relay connection failed");
                    break;
                }
            }
        }
        debug!("Relay connection closed");
    });

    Ok(Transport { outbound, inbound })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ws_url() {
        assert_eq!(build_ws_url("ws://localhost:8048", "pets"), "ws://localhost:8048/pets");
        assert_eq!(build_ws_url("http://localhost:8048", "pets"), "ws://localhost:8048/pets");
        assert_eq!(
            build_ws_url("https://sync.example.com/", "shop/list"),
            "wss://sync.example.com/shop/list"
        );
        assert_eq!(build_ws_url("localhost:8048", "/pets"), "ws://localhost:8048/pets");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let result = connect("ws://127.0.0.1:1/pets").await;
        assert!(matches!(result, Err(SyncError::ConnectionError(_))));
    }
}
