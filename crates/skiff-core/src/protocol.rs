//! Wire formats for the two message layers.
//!
//! Relay (signaling) messages travel between a role and the rendezvous
//! relay as JSON tagged by `type`; the relay forwards them opaquely by
//! `session_id`. Channel messages travel over the established data
//! channel, also tagged by `type` (and `action` within `key_exchange`).
//! Field names are part of the protocol and must not change.

use serde::{Deserialize, Serialize};

/// Exit code reserved for "execution could not be attempted"
/// (isolation unavailable, timeout, setup failure). Always paired with
/// an explanatory stderr so it cannot be mistaken for a real process
/// exit code.
pub const EXIT_CODE_UNAVAILABLE: i32 = -1;

/// An ICE candidate relayed verbatim between the peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u32>,
}

/// Messages exchanged with the relay, in both directions. Every
/// variant carries the `session_id` the relay routes on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Client announces intent to open a session.
    CreateSession { session_id: String },
    /// Relay acknowledgement of `create_session`.
    SessionCreated { session_id: String },
    /// Opaque transport-negotiation offer, client -> node.
    Offer { session_id: String, offer: String },
    /// Opaque transport-negotiation answer, node -> client.
    Answer { session_id: String, answer: String },
    /// Trickled transport candidate, either direction. Duplicates and
    /// post-teardown arrivals are dropped silently by the receiver.
    IceCandidate {
        session_id: String,
        candidate: IceCandidate,
    },
    /// Relay-side failure report (unknown session, malformed message).
    Error { message: String },
}

impl SignalMessage {
    /// The session this message belongs to, if it names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SignalMessage::CreateSession { session_id }
            | SignalMessage::SessionCreated { session_id }
            | SignalMessage::Offer { session_id, .. }
            | SignalMessage::Answer { session_id, .. }
            | SignalMessage::IceCandidate { session_id, .. } => Some(session_id),
            SignalMessage::Error { .. } => None,
        }
    }
}

/// The `key_exchange` sub-protocol, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum KeyExchange {
    /// Each side sends its own RSA public key as soon as the channel
    /// opens. PEM, ASCII-safe, self-delimiting.
    SendPublicKey { public_key: String },
    /// Client -> node: the fresh AES session key, sealed under the
    /// node's public key. Only the client ever sends this.
    SendAesKey { encrypted_aes_key: String },
    /// Node -> client: acknowledges the session key; the handshake is
    /// complete on both sides once this arrives.
    AesKeyReceived,
}

/// Messages exchanged over the established data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    KeyExchange {
        #[serde(flatten)]
        exchange: KeyExchange,
    },
    /// Sealed [`TaskPayload`].
    EncryptedTask { encrypted_data: String },
    /// Sealed [`TaskResult`].
    EncryptedResult { encrypted_data: String },
}

impl From<KeyExchange> for ChannelMessage {
    fn from(exchange: KeyExchange) -> Self {
        ChannelMessage::KeyExchange { exchange }
    }
}

/// The plaintext sealed inside `encrypted_task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Opaque code/command string, consumed once by the executor.
    pub code: String,
    /// Task-kind tag, e.g. `python_code`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// The plaintext sealed inside `encrypted_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Measured wall-clock duration in seconds.
    pub execution_time: f64,
}

impl TaskResult {
    /// A "could not execute" result. `stderr` must name the reason.
    pub fn unavailable(stderr: impl Into<String>, execution_time: f64) -> Self {
        Self {
            exit_code: EXIT_CODE_UNAVAILABLE,
            stdout: String::new(),
            stderr: stderr.into(),
            execution_time,
        }
    }
}
