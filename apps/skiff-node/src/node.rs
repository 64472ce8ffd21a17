//! The compute node: answers offers from the relay, runs one task per
//! session, and reports sealed results back over the data channel.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use skiff_core::protocol::{ChannelMessage, SignalMessage};
use skiff_core::session::{Action, Role, SessionStateMachine};
use skiff_core::signaling::SignalingClient;
use skiff_core::transport::webrtc::{
    TransportSignal, WebRtcConfig, WebRtcRole, WebRtcTransport,
};
use skiff_core::transport::Transport;
use tokio::sync::{mpsc, oneshot, watch};

use crate::registry::{SessionHandle, SessionRegistry};
use crate::sandbox::Executor;
use crate::supervisor::ReconnectSupervisor;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub relay_url: String,
    pub webrtc: WebRtcConfig,
}

pub struct Node {
    config: NodeConfig,
    registry: Arc<SessionRegistry>,
    executor: Arc<dyn Executor>,
}

impl Node {
    pub fn new(config: NodeConfig, executor: Arc<dyn Executor>) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            executor,
        }
    }

    /// Main loop: hold a relay connection, spawn a session per inbound
    /// offer, route trickled candidates, reconnect on loss. Returns on
    /// shutdown or when the initial connect is exhausted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let relay_url = self.config.relay_url.clone();
        let mut supervisor = ReconnectSupervisor::new(
            move || {
                let relay_url = relay_url.clone();
                async move { SignalingClient::connect(&relay_url).await }
            },
            shutdown.clone(),
        );

        let mut relay = Arc::new(
            supervisor
                .connect_initial()
                .await
                .context("could not reach the relay")?,
        );
        tracing::info!(target = "node", relay = %self.config.relay_url, "connected to relay");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = relay.recv() => {
                    match message {
                        Some(message) => self.handle_signal(&relay, message),
                        None => {
                            tracing::warn!(target = "node", "relay connection lost");
                            // In-flight sessions cannot outlive the
                            // relay link that negotiated them.
                            self.registry.clear();
                            match supervisor.reconnect().await {
                                Some(restored) => relay = Arc::new(restored),
                                None => break,
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(target = "node", "shutting down");
        self.registry.clear();
        Ok(())
    }

    fn handle_signal(&self, relay: &Arc<SignalingClient>, message: SignalMessage) {
        match message {
            SignalMessage::Offer { session_id, offer } => {
                tracing::info!(target = "node", session_id = %session_id, "offer received");
                self.spawn_session(relay, session_id, offer);
            }
            SignalMessage::IceCandidate {
                session_id,
                candidate,
            } => {
                route_ice(&self.registry, &session_id, TransportSignal::Ice(candidate));
            }
            SignalMessage::Error { message } => {
                tracing::warn!(target = "node", error = %message, "relay reported an error");
            }
            other => {
                tracing::debug!(target = "node", message = ?other, "ignoring relay message");
            }
        }
    }

    /// One task per offer: negotiate an answerer-side transport, run
    /// the session to completion, deregister.
    fn spawn_session(&self, relay: &Arc<SignalingClient>, session_id: String, offer: String) {
        let (signal_tx, from_peer) = mpsc::unbounded_channel::<TransportSignal>();
        let (to_peer, mut outbound) = mpsc::unbounded_channel::<TransportSignal>();

        // The offer that created this session is the transport's first
        // inbound signal.
        if signal_tx.send(TransportSignal::Offer(offer)).is_err() {
            return;
        }

        // Outbound negotiation signals get the session id stamped back
        // on before they reach the relay.
        let relay_out = relay.clone();
        let outbound_session = session_id.clone();
        tokio::spawn(async move {
            while let Some(signal) = outbound.recv().await {
                let message = match signal {
                    TransportSignal::Answer(answer) => SignalMessage::Answer {
                        session_id: outbound_session.clone(),
                        answer,
                    },
                    TransportSignal::Ice(candidate) => SignalMessage::IceCandidate {
                        session_id: outbound_session.clone(),
                        candidate,
                    },
                    TransportSignal::Offer(_) => continue,
                };
                if relay_out.send(message).is_err() {
                    break;
                }
            }
        });

        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let registry = self.registry.clone();
        let executor = self.executor.clone();
        let webrtc = self.config.webrtc.clone();
        let task_session = session_id.clone();
        let task = tokio::spawn(async move {
            // Wait until the registry entry exists so teardown cannot
            // race registration.
            let _ = registered_rx.await;
            let transport =
                match WebRtcTransport::connect(WebRtcRole::Answerer, webrtc, to_peer, from_peer)
                    .await
                {
                    Ok(transport) => transport,
                    Err(err) => {
                        tracing::warn!(
                            target = "node",
                            session_id = %task_session,
                            error = %err,
                            "transport negotiation failed"
                        );
                        registry.remove(&task_session);
                        return;
                    }
                };
            drive_session(&task_session, &transport, executor.as_ref()).await;
            transport.close().await;
            registry.remove(&task_session);
        });

        self.registry.insert(
            &session_id,
            SessionHandle {
                signal_tx,
                task,
                created_at: Instant::now(),
            },
        );
        let _ = registered_tx.send(());
    }
}

/// Forward a relay-routed signal into a session's transport. A miss is
/// benign: candidates for finished or unknown sessions are dropped.
fn route_ice(registry: &SessionRegistry, session_id: &str, signal: TransportSignal) -> bool {
    match registry.lookup(session_id) {
        Some(signal_tx) => signal_tx.send(signal).is_ok(),
        None => {
            tracing::debug!(
                target = "node",
                session_id,
                "dropping signal for unknown session"
            );
            false
        }
    }
}

/// Run the node side of one session over an open transport: handshake,
/// one task, one sealed result, close.
async fn drive_session(session_id: &str, transport: &dyn Transport, executor: &dyn Executor) {
    let mut session = SessionStateMachine::new(session_id, Role::Node);
    session.begin_signaling();

    let opening = match session.on_channel_open() {
        Ok(actions) => actions,
        Err(err) => {
            tracing::warn!(target = "node", session_id, error = %err, "session setup failed");
            return;
        }
    };
    if !apply_actions(&mut session, transport, executor, opening).await {
        return;
    }

    while let Some(raw) = transport.recv().await {
        let message: ChannelMessage = match serde_json::from_slice(&raw) {
            Ok(message) => message,
            Err(err) => {
                // Unparseable channel traffic kills the session
                // without a reply.
                tracing::warn!(target = "node", session_id, error = %err, "undecodable channel message");
                session.close();
                return;
            }
        };
        let actions = match session.handle_message(message) {
            Ok(actions) => actions,
            Err(err) => {
                tracing::warn!(target = "node", session_id, error = %err, "session aborted");
                return;
            }
        };
        if !apply_actions(&mut session, transport, executor, actions).await {
            return;
        }
    }
    session.close();
}

/// Apply session actions in order, feeding executor output back in.
/// Returns false once the session should stop being driven.
async fn apply_actions(
    session: &mut SessionStateMachine,
    transport: &dyn Transport,
    executor: &dyn Executor,
    actions: Vec<Action>,
) -> bool {
    let mut queue = std::collections::VecDeque::from(actions);
    while let Some(action) = queue.pop_front() {
        match action {
            Action::Send(message) => {
                let raw = match serde_json::to_vec(&message) {
                    Ok(raw) => raw,
                    Err(err) => {
                        tracing::warn!(target = "node", error = %err, "message serialization failed");
                        session.close();
                        return false;
                    }
                };
                if let Err(err) = transport.send(&raw).await {
                    tracing::warn!(target = "node", error = %err, "channel send failed");
                    session.close();
                    return false;
                }
            }
            Action::Execute(task) => {
                let result = executor.execute(task).await;
                match session.complete_task(&result) {
                    Ok(more) => queue.extend(more),
                    Err(err) => {
                        tracing::warn!(target = "node", error = %err, "result delivery failed");
                        return false;
                    }
                }
            }
            Action::Deliver(result) => {
                tracing::debug!(
                    target = "node",
                    exit_code = result.exit_code,
                    "ignoring client-side action"
                );
            }
            Action::Close => {
                session.close();
                return false;
            }
        }
    }
    true
}
