//! Client side of one task submission: announce the session to the
//! relay, negotiate the transport as the offerer, run the key
//! handshake, submit the sealed task, and wait for the sealed result.

use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use skiff_core::protocol::{ChannelMessage, SignalMessage, TaskPayload, TaskResult};
use skiff_core::session::{Action, Role, SessionError, SessionStateMachine};
use skiff_core::signaling::SignalingClient;
use skiff_core::transport::Transport;
use skiff_core::transport::webrtc::{
    TransportSignal, WebRtcConfig, WebRtcRole, WebRtcTransport,
};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub webrtc: WebRtcConfig,
    /// Bound on the whole setup phase: relay acknowledgement, transport
    /// negotiation, and key handshake.
    pub ready_timeout: Duration,
    /// Bound on the wait for the sealed result after the task is
    /// submitted. Must cover the node's task timeout plus its grace
    /// period.
    pub result_timeout: Duration,
    /// Session id to announce to the relay; a fresh UUIDv4 when absent.
    pub session_id: Option<String>,
}

fn resolve_session_id(requested: Option<String>) -> String {
    requested.unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Stamp a session id onto an outbound negotiation signal.
fn signal_for(session_id: &str, signal: TransportSignal) -> SignalMessage {
    match signal {
        TransportSignal::Offer(offer) => SignalMessage::Offer {
            session_id: session_id.to_string(),
            offer,
        },
        TransportSignal::Answer(answer) => SignalMessage::Answer {
            session_id: session_id.to_string(),
            answer,
        },
        TransportSignal::Ice(candidate) => SignalMessage::IceCandidate {
            session_id: session_id.to_string(),
            candidate,
        },
    }
}

/// Inbound relay message -> transport signal, if it is negotiation
/// traffic for our session. Everything else is ignored here.
fn signal_from(session_id: &str, message: &SignalMessage) -> Option<TransportSignal> {
    if message.session_id() != Some(session_id) {
        return None;
    }
    match message {
        SignalMessage::Answer { answer, .. } => Some(TransportSignal::Answer(answer.clone())),
        SignalMessage::IceCandidate { candidate, .. } => {
            Some(TransportSignal::Ice(candidate.clone()))
        }
        _ => None,
    }
}

/// Submit one task and wait for its result.
pub async fn submit(config: ClientConfig, task: TaskPayload) -> anyhow::Result<TaskResult> {
    let session_id = resolve_session_id(config.session_id.clone());
    tracing::info!(target = "client", session_id = %session_id, "submitting task");

    let relay = std::sync::Arc::new(
        SignalingClient::connect(&config.relay_url)
            .await
            .context("could not reach the relay")?,
    );

    relay.send(SignalMessage::CreateSession {
        session_id: session_id.clone(),
    })?;

    // The relay must acknowledge before the offer goes out; anything
    // else it sends this early is noise.
    let acked = tokio::time::timeout(config.ready_timeout, async {
        while let Some(message) = relay.recv().await {
            match message {
                SignalMessage::SessionCreated { session_id: acked } if acked == session_id => {
                    return Ok(());
                }
                SignalMessage::Error { message } => {
                    return Err(anyhow!("relay rejected the session: {message}"));
                }
                other => {
                    tracing::debug!(target = "client", message = ?other, "ignoring relay message");
                }
            }
        }
        Err(anyhow!("relay connection closed during session setup"))
    })
    .await;
    match acked {
        Ok(result) => result?,
        Err(_) => bail!("timed out waiting for the relay to acknowledge the session"),
    }

    let (to_peer, mut outbound) = mpsc::unbounded_channel::<TransportSignal>();
    let (inbound_tx, from_peer) = mpsc::unbounded_channel::<TransportSignal>();

    let relay_out = relay.clone();
    let outbound_session = session_id.clone();
    let outbound_pump = tokio::spawn(async move {
        while let Some(signal) = outbound.recv().await {
            if relay_out.send(signal_for(&outbound_session, signal)).is_err() {
                break;
            }
        }
    });

    let relay_in = relay.clone();
    let inbound_session = session_id.clone();
    let inbound_pump = tokio::spawn(async move {
        while let Some(message) = relay_in.recv().await {
            if let Some(signal) = signal_from(&inbound_session, &message) {
                if inbound_tx.send(signal).is_err() {
                    break;
                }
            }
        }
    });

    let outcome = run_session(&config, &session_id, to_peer, from_peer, task).await;

    outbound_pump.abort();
    inbound_pump.abort();
    outcome
}

async fn run_session(
    config: &ClientConfig,
    session_id: &str,
    to_peer: mpsc::UnboundedSender<TransportSignal>,
    from_peer: mpsc::UnboundedReceiver<TransportSignal>,
    task: TaskPayload,
) -> anyhow::Result<TaskResult> {
    let mut webrtc = config.webrtc.clone();
    webrtc.open_timeout = webrtc.open_timeout.min(config.ready_timeout);
    let transport = WebRtcTransport::connect(WebRtcRole::Offerer, webrtc, to_peer, from_peer)
        .await
        .context("transport negotiation failed")?;

    let mut session = SessionStateMachine::new(session_id, Role::Client);
    session.begin_signaling();

    let result = drive(
        &mut session,
        &transport,
        config.ready_timeout,
        config.result_timeout,
        task,
    )
    .await;
    session.close();
    transport.close().await;
    result
}

async fn drive(
    session: &mut SessionStateMachine,
    transport: &dyn Transport,
    ready_timeout: Duration,
    result_timeout: Duration,
    task: TaskPayload,
) -> anyhow::Result<TaskResult> {
    let actions = session.on_channel_open()?;
    send_all(transport, actions).await?;

    // Handshake, bounded: pump channel messages until the session key
    // is acknowledged. The session stays closeable on timeout.
    let handshake = tokio::time::timeout(ready_timeout, async {
        while !session.is_ready() {
            let raw = transport
                .recv()
                .await
                .ok_or_else(|| anyhow!("channel closed during key exchange"))?;
            let message: ChannelMessage =
                serde_json::from_slice(&raw).context("undecodable channel message")?;
            let actions = session.handle_message(message)?;
            send_all(transport, actions).await?;
        }
        Ok::<(), anyhow::Error>(())
    })
    .await;
    match handshake {
        Ok(result) => result?,
        Err(_) => return Err(SessionError::ConnectTimeout.into()),
    }

    send_all(transport, session.submit_task(&task)?).await?;

    // Result wait, also bounded: a node that wedges without closing
    // the channel must not hang the client.
    let wait = tokio::time::timeout(result_timeout, async {
        while let Some(raw) = transport.recv().await {
            let message: ChannelMessage =
                serde_json::from_slice(&raw).context("undecodable channel message")?;
            let actions = session.handle_message(message)?;
            let mut delivered = None;
            for action in actions {
                match action {
                    Action::Send(message) => {
                        let raw = serde_json::to_vec(&message)?;
                        transport.send(&raw).await?;
                    }
                    Action::Deliver(result) => delivered = Some(result),
                    Action::Close => {}
                    Action::Execute(_) => {
                        tracing::debug!(target = "client", "ignoring node-side action");
                    }
                }
            }
            if let Some(result) = delivered {
                return Ok(result);
            }
        }
        bail!("channel closed before the result arrived")
    })
    .await;
    match wait {
        Ok(result) => result,
        Err(_) => bail!(
            "timed out after {}s waiting for the task result",
            result_timeout.as_secs()
        ),
    }
}

async fn send_all(transport: &dyn Transport, actions: Vec<Action>) -> anyhow::Result<()> {
    for action in actions {
        if let Action::Send(message) = action {
            let raw = serde_json::to_vec(&message)?;
            transport.send(&raw).await?;
        }
    }
    Ok(())
}
