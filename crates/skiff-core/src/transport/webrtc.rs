//! WebRTC data-channel implementation of [`Transport`].
//!
//! Offer/answer and trickled ICE candidates do not flow through the
//! relay from here: the role driver bridges them via a pair of mpsc
//! channels carrying [`TransportSignal`]s, so this module knows
//! nothing about session ids or the relay wire format. Candidate
//! gathering, STUN, and connectivity checks are the `webrtc` crate's
//! concern.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{Transport, TransportError};
use crate::protocol::IceCandidate;

const DATA_CHANNEL_LABEL: &str = "skiff-task";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebRtcRole {
    /// Creates the data channel and the SDP offer (the client).
    Offerer,
    /// Accepts both (the compute node).
    Answerer,
}

/// Transport-negotiation payloads shuttled between this transport and
/// the relay by the role driver, stripped of any session addressing.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    Offer(String),
    Answer(String),
    Ice(IceCandidate),
}

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub stun_servers: Vec<String>,
    /// How long to wait for the data channel to open before giving up.
    pub open_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            open_timeout: Duration::from_secs(30),
        }
    }
}

pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    channel: Arc<parking_lot::Mutex<Option<Arc<RTCDataChannel>>>>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    open_rx: watch::Receiver<bool>,
    open_tx: Arc<watch::Sender<bool>>,
    pump: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WebRtcTransport {
    /// Establish the peer connection and wait (bounded) for the data
    /// channel to open.
    pub async fn connect(
        role: WebRtcRole,
        config: WebRtcConfig,
        to_peer: mpsc::UnboundedSender<TransportSignal>,
        from_peer: mpsc::UnboundedReceiver<TransportSignal>,
    ) -> Result<Self, TransportError> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .stun_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| TransportError::Setup(err.to_string()))?,
        );

        let (data_tx, data_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (open_tx, open_rx) = watch::channel(false);
        let open_tx = Arc::new(open_tx);
        let channel = Arc::new(parking_lot::Mutex::new(None::<Arc<RTCDataChannel>>));

        let open_for_state = open_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let open = open_for_state.clone();
                Box::pin(async move {
                    tracing::debug!(target = "webrtc", ?state, "peer connection state changed");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Disconnected
                            | RTCPeerConnectionState::Closed
                    ) {
                        let _ = open.send(false);
                    }
                })
            },
        ));

        let ice_out = to_peer.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ice_out = ice_out.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = ice_out.send(TransportSignal::Ice(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index.map(u32::from),
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "candidate serialization failed");
                    }
                }
            })
        }));

        match role {
            WebRtcRole::Offerer => {
                let dc = peer_connection
                    .create_data_channel(
                        DATA_CHANNEL_LABEL,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await
                    .map_err(|err| TransportError::Setup(err.to_string()))?;
                wire_data_channel(&dc, data_tx.clone(), open_tx.clone());
                *channel.lock() = Some(dc);

                let offer = peer_connection
                    .create_offer(None)
                    .await
                    .map_err(|err| TransportError::Setup(err.to_string()))?;
                let sdp = offer.sdp.clone();
                peer_connection
                    .set_local_description(offer)
                    .await
                    .map_err(|err| TransportError::Setup(err.to_string()))?;
                to_peer
                    .send(TransportSignal::Offer(sdp))
                    .map_err(|_| TransportError::ChannelClosed)?;
            }
            WebRtcRole::Answerer => {
                let channel_slot = channel.clone();
                let data_tx = data_tx.clone();
                let open_tx_for_dc = open_tx.clone();
                peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let channel_slot = channel_slot.clone();
                    let data_tx = data_tx.clone();
                    let open_tx = open_tx_for_dc.clone();
                    Box::pin(async move {
                        tracing::debug!(target = "webrtc", label = %dc.label(), "data channel received");
                        wire_data_channel(&dc, data_tx, open_tx);
                        *channel_slot.lock() = Some(dc);
                    })
                }));
            }
        }

        let pump = tokio::spawn(signal_pump(
            role,
            peer_connection.clone(),
            from_peer,
            to_peer,
        ));

        let transport = Self {
            peer_connection,
            channel,
            inbound: AsyncMutex::new(data_rx),
            open_rx,
            open_tx,
            pump: parking_lot::Mutex::new(Some(pump)),
        };

        transport.wait_open(config.open_timeout).await?;
        Ok(transport)
    }

    async fn wait_open(&self, limit: Duration) -> Result<(), TransportError> {
        let mut open_rx = self.open_rx.clone();
        let wait = async move {
            while !*open_rx.borrow() {
                if open_rx.changed().await.is_err() {
                    return Err(TransportError::ChannelClosed);
                }
            }
            Ok(())
        };
        match tokio::time::timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => {
                self.close().await;
                Err(TransportError::OpenTimeout)
            }
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let dc = self
            .channel
            .lock()
            .clone()
            .ok_or(TransportError::ChannelClosed)?;
        dc.send(&Bytes::copy_from_slice(data))
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Setup(err.to_string()))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut rx = self.inbound.lock().await;
        rx.recv().await
    }

    fn is_open(&self) -> bool {
        *self.open_rx.borrow()
    }

    async fn close(&self) {
        let _ = self.open_tx.send(false);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Err(err) = self.peer_connection.close().await {
            tracing::debug!(target = "webrtc", error = %err, "peer connection close");
        }
    }
}

fn wire_data_channel(
    dc: &Arc<RTCDataChannel>,
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
    open_tx: Arc<watch::Sender<bool>>,
) {
    let open_for_open = open_tx.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel open");
            let _ = open_for_open.send(true);
        })
    }));

    dc.on_close(Box::new(move || {
        let open_tx = open_tx.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel closed");
            let _ = open_tx.send(false);
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let data_tx = data_tx.clone();
        Box::pin(async move {
            let _ = data_tx.send(msg.data.to_vec());
        })
    }));
}

/// Apply inbound negotiation signals to the peer connection.
/// Candidates that trickle in before the remote description is set are
/// held back, since the stack rejects them until then.
async fn signal_pump(
    role: WebRtcRole,
    peer_connection: Arc<RTCPeerConnection>,
    mut from_peer: mpsc::UnboundedReceiver<TransportSignal>,
    to_peer: mpsc::UnboundedSender<TransportSignal>,
) {
    let mut have_remote = false;
    let mut pending: Vec<IceCandidate> = Vec::new();

    while let Some(signal) = from_peer.recv().await {
        match (role, signal) {
            (WebRtcRole::Answerer, TransportSignal::Offer(sdp)) => {
                let offer = match RTCSessionDescription::offer(sdp) {
                    Ok(offer) => offer,
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "malformed offer");
                        continue;
                    }
                };
                if let Err(err) = peer_connection.set_remote_description(offer).await {
                    tracing::warn!(target = "webrtc", error = %err, "set remote offer failed");
                    continue;
                }
                have_remote = true;
                flush_candidates(&peer_connection, &mut pending).await;

                let answer = match peer_connection.create_answer(None).await {
                    Ok(answer) => answer,
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "create answer failed");
                        continue;
                    }
                };
                let sdp = answer.sdp.clone();
                if let Err(err) = peer_connection.set_local_description(answer).await {
                    tracing::warn!(target = "webrtc", error = %err, "set local answer failed");
                    continue;
                }
                if to_peer.send(TransportSignal::Answer(sdp)).is_err() {
                    break;
                }
            }
            (WebRtcRole::Offerer, TransportSignal::Answer(sdp)) => {
                let answer = match RTCSessionDescription::answer(sdp) {
                    Ok(answer) => answer,
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "malformed answer");
                        continue;
                    }
                };
                if let Err(err) = peer_connection.set_remote_description(answer).await {
                    tracing::warn!(target = "webrtc", error = %err, "set remote answer failed");
                    continue;
                }
                have_remote = true;
                flush_candidates(&peer_connection, &mut pending).await;
            }
            (_, TransportSignal::Ice(candidate)) => {
                if have_remote {
                    add_candidate(&peer_connection, candidate).await;
                } else {
                    pending.push(candidate);
                }
            }
            (_, signal) => {
                tracing::debug!(target = "webrtc", ?signal, "ignoring unexpected signal");
            }
        }
    }
}

async fn flush_candidates(peer_connection: &Arc<RTCPeerConnection>, pending: &mut Vec<IceCandidate>) {
    for candidate in pending.drain(..) {
        add_candidate(peer_connection, candidate).await;
    }
}

async fn add_candidate(peer_connection: &Arc<RTCPeerConnection>, candidate: IceCandidate) {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index.map(|idx| idx as u16),
        username_fragment: None,
    };
    if let Err(err) = peer_connection.add_ice_candidate(init).await {
        tracing::debug!(target = "webrtc", error = %err, "add ice candidate failed");
    }
}
