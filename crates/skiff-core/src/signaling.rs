//! WebSocket client for the rendezvous relay.
//!
//! The relay is an external collaborator: it forwards
//! [`SignalMessage`]s opaquely by `session_id` between a client and a
//! compute node that cannot address each other directly. This client
//! owns the socket, a writer task fed by an mpsc sender, and a reader
//! task decoding inbound frames; both tasks are aborted on drop.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;
use url::Url;

use crate::protocol::SignalMessage;

#[derive(Debug, Error)]
pub enum SignalError {
    /// The relay could not be reached. Retried with backoff by the
    /// node's reconnect supervisor; fatal for a one-shot client.
    #[error("relay connection failed: {0}")]
    Connect(String),
    /// The relay connection dropped.
    #[error("relay connection closed")]
    Closed,
}

pub struct SignalingClient {
    send_tx: mpsc::UnboundedSender<SignalMessage>,
    recv_rx: AsyncMutex<mpsc::UnboundedReceiver<SignalMessage>>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect to the relay. Accepts `http(s)` URLs (rewritten to
    /// `ws(s)`) as well as native websocket URLs.
    pub async fn connect(relay_url: &str) -> Result<Self, SignalError> {
        let url = websocket_url(relay_url)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalError::Connect(err.to_string()))?;
        tracing::debug!(target = "signaling", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel::<SignalMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "signaling", error = %err, "signal serialization failed");
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => forward_frame(text.as_bytes(), &recv_tx),
                    Ok(Message::Binary(data)) => forward_frame(&data, &recv_tx),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                    ) => {
                        tracing::debug!(target = "signaling", "relay websocket closed");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(target = "signaling", error = %err, "relay websocket error");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            send_tx,
            recv_rx: AsyncMutex::new(recv_rx),
            tasks: std::sync::Mutex::new(vec![writer, reader]),
        })
    }

    pub fn send(&self, message: SignalMessage) -> Result<(), SignalError> {
        self.send_tx.send(message).map_err(|_| SignalError::Closed)
    }

    /// Next relay message. `None` once the connection is gone.
    pub async fn recv(&self) -> Option<SignalMessage> {
        let mut rx = self.recv_rx.lock().await;
        rx.recv().await
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

fn forward_frame(raw: &[u8], recv_tx: &mpsc::UnboundedSender<SignalMessage>) {
    match serde_json::from_slice::<SignalMessage>(raw) {
        Ok(message) => {
            let _ = recv_tx.send(message);
        }
        Err(err) => {
            // A malformed relay frame is logged and skipped; it must
            // not take the whole connection down.
            tracing::warn!(target = "signaling", error = %err, "undecodable relay frame");
        }
    }
}

fn websocket_url(relay_url: &str) -> Result<Url, SignalError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| SignalError::Connect(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(SignalError::Connect(format!(
                "unsupported relay url scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalError::Connect("invalid websocket scheme".into()))?;
    Ok(url)
}
