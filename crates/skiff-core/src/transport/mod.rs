//! Abstraction over the ordered, reliable, message-based channel
//! between client and compute node.
//!
//! The core never assumes WebRTC: session drivers talk to a
//! [`Transport`], tests use the in-process [`pair`], and production
//! uses [`webrtc`], whose NAT-traversal mechanics belong to the
//! `webrtc` crate, not to this codebase.

use async_trait::async_trait;
use thiserror::Error;

pub mod pair;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("timed out waiting for the channel to open")]
    OpenTimeout,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message to the remote peer.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next message. `None` means the channel is closed
    /// and will deliver nothing further.
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Whether the channel is currently usable.
    fn is_open(&self) -> bool;

    /// Close the channel and release the underlying resources.
    /// Idempotent.
    async fn close(&self);
}
