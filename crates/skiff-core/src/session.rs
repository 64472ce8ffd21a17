//! Per-session protocol state machine.
//!
//! One [`SessionStateMachine`] exists per logical task exchange, on
//! each side. It owns the session's [`CryptoSession`] and nothing
//! else: transport events and channel messages are fed in through
//! explicit methods, and every method returns the [`Action`]s the
//! driver must apply (send a message, execute a task, deliver a
//! result, close the channel). There are no callbacks and no implicit
//! ordering assumptions, so every transition is testable on its own.
//!
//! The handshake is deliberately asymmetric: only the client generates
//! the symmetric session key; the node is a pure responder.

use thiserror::Error;

use crate::crypto::{CryptoError, CryptoSession};
use crate::protocol::{ChannelMessage, KeyExchange, TaskPayload, TaskResult};

/// Which end of the session this state machine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiator: submits the task, generates the session key.
    Client,
    /// Responder: executes the task, never generates the session key.
    Node,
}

/// Protocol states. `Failed` is absorbing and reachable from every
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Signaling,
    ChannelOpen,
    AwaitingPeerKey,
    KeyEstablished,
    TaskInFlight,
    ResultSent,
    Closed,
    Failed,
}

impl SessionState {
    fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// What the driver must do after feeding an event in.
#[derive(Debug)]
pub enum Action {
    /// Send a message over the data channel.
    Send(ChannelMessage),
    /// Node: run the decrypted task and report back via
    /// [`SessionStateMachine::complete_task`].
    Execute(TaskPayload),
    /// Client: surface the decrypted result to the caller.
    Deliver(TaskResult),
    /// Close the data channel and tear the session down.
    Close,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// A message arrived that the protocol does not allow in the
    /// current state. The session is aborted without a reply.
    #[error("protocol violation in {state:?}: {detail}")]
    Protocol {
        state: SessionState,
        detail: String,
    },
    /// A sealed plaintext did not parse as the expected JSON shape.
    #[error("malformed payload: {0}")]
    Decode(String),
    /// The bounded readiness wait elapsed before the channel opened
    /// and the session key was established. The session remains
    /// closeable.
    #[error("timed out waiting for session readiness")]
    ConnectTimeout,
}

pub struct SessionStateMachine {
    session_id: String,
    role: Role,
    state: SessionState,
    crypto: CryptoSession,
    sent_public_key: bool,
    peer_public_key: Option<String>,
    /// A peer key that arrived before we processed channel-open is
    /// buffered, not dropped.
    buffered_peer_key: Option<String>,
}

impl SessionStateMachine {
    pub fn new(session_id: impl Into<String>, role: Role) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            state: SessionState::Init,
            crypto: CryptoSession::new(),
            sent_public_key: false,
            peer_public_key: None,
            buffered_peer_key: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True once the handshake has completed locally and sealed
    /// payloads may flow.
    pub fn is_ready(&self) -> bool {
        matches!(
            self.state,
            SessionState::KeyEstablished | SessionState::TaskInFlight | SessionState::ResultSent
        )
    }

    /// Session setup with the relay has begun.
    pub fn begin_signaling(&mut self) {
        if self.state == SessionState::Init {
            self.state = SessionState::Signaling;
        }
    }

    /// The transport channel became usable. Both sides send their
    /// public key immediately; a buffered peer key (one that raced
    /// ahead of channel-open) is processed right after.
    pub fn on_channel_open(&mut self) -> Result<Vec<Action>, SessionError> {
        match self.state {
            SessionState::Init | SessionState::Signaling => {}
            state => {
                return self.abort(SessionError::Protocol {
                    state,
                    detail: "channel opened twice".into(),
                });
            }
        }
        self.state = SessionState::ChannelOpen;

        let pem = match self.crypto.public_key_pem() {
            Ok(pem) => pem,
            Err(err) => return self.abort(err.into()),
        };
        self.sent_public_key = true;
        self.state = SessionState::AwaitingPeerKey;
        let mut actions = vec![Action::Send(
            KeyExchange::SendPublicKey { public_key: pem }.into(),
        )];

        if let Some(peer_key) = self.buffered_peer_key.take() {
            actions.extend(self.on_peer_public_key(peer_key)?);
        }
        Ok(actions)
    }

    /// Single dispatch point for every inbound channel message.
    pub fn handle_message(&mut self, message: ChannelMessage) -> Result<Vec<Action>, SessionError> {
        if self.state.is_terminal() {
            tracing::debug!(
                target = "session",
                session_id = %self.session_id,
                state = ?self.state,
                "dropping message for terminal session"
            );
            return Ok(Vec::new());
        }
        match message {
            ChannelMessage::KeyExchange { exchange } => self.handle_key_exchange(exchange),
            ChannelMessage::EncryptedTask { encrypted_data } => self.handle_task(&encrypted_data),
            ChannelMessage::EncryptedResult { encrypted_data } => {
                self.handle_result(&encrypted_data)
            }
        }
    }

    fn handle_key_exchange(&mut self, exchange: KeyExchange) -> Result<Vec<Action>, SessionError> {
        match exchange {
            KeyExchange::SendPublicKey { public_key } => {
                if !self.sent_public_key {
                    self.buffered_peer_key = Some(public_key);
                    return Ok(Vec::new());
                }
                self.on_peer_public_key(public_key)
            }
            KeyExchange::SendAesKey { encrypted_aes_key } => {
                if self.role != Role::Node {
                    return self.abort(SessionError::Protocol {
                        state: self.state,
                        detail: "client received send_aes_key".into(),
                    });
                }
                if self.state != SessionState::AwaitingPeerKey {
                    return self.abort(SessionError::Protocol {
                        state: self.state,
                        detail: "send_aes_key outside key exchange".into(),
                    });
                }
                // Wrong keypair or corrupted ciphertext aborts the
                // session without a reply; the failure is not retried.
                if let Err(err) = self.crypto.unseal_session_key(&encrypted_aes_key) {
                    return self.abort(err.into());
                }
                self.state = SessionState::KeyEstablished;
                tracing::info!(
                    target = "session",
                    session_id = %self.session_id,
                    "session key established"
                );
                Ok(vec![Action::Send(KeyExchange::AesKeyReceived.into())])
            }
            KeyExchange::AesKeyReceived => {
                if self.role != Role::Client || !self.crypto.is_ready() {
                    return self.abort(SessionError::Protocol {
                        state: self.state,
                        detail: "unexpected aes_key_received".into(),
                    });
                }
                self.state = SessionState::KeyEstablished;
                tracing::info!(
                    target = "session",
                    session_id = %self.session_id,
                    "handshake complete"
                );
                Ok(Vec::new())
            }
        }
    }

    fn on_peer_public_key(&mut self, public_key: String) -> Result<Vec<Action>, SessionError> {
        if self.peer_public_key.is_some() {
            // Duplicate peer key: idempotent, nothing to resend.
            return Ok(Vec::new());
        }
        self.peer_public_key = Some(public_key.clone());
        match self.role {
            // Only the client drives key generation.
            Role::Client => {
                let sealed = match self.crypto.seal_session_key(&public_key) {
                    Ok(sealed) => sealed,
                    Err(err) => return self.abort(err.into()),
                };
                Ok(vec![Action::Send(
                    KeyExchange::SendAesKey {
                        encrypted_aes_key: sealed,
                    }
                    .into(),
                )])
            }
            // The node already sent its key on channel-open and now
            // waits for the sealed session key.
            Role::Node => Ok(Vec::new()),
        }
    }

    fn handle_task(&mut self, encrypted_data: &str) -> Result<Vec<Action>, SessionError> {
        if self.role != Role::Node {
            return self.abort(SessionError::Protocol {
                state: self.state,
                detail: "client received encrypted_task".into(),
            });
        }
        // A task before the key is established is a protocol
        // violation, not a crypto failure.
        if self.state != SessionState::KeyEstablished {
            return self.abort(SessionError::Protocol {
                state: self.state,
                detail: "encrypted_task before key establishment".into(),
            });
        }
        let plaintext = match self.crypto.unseal(encrypted_data) {
            Ok(plaintext) => plaintext,
            // Tampered or corrupted: abort without replying so an
            // attacker probing payloads gets no oracle.
            Err(err) => return self.abort(err.into()),
        };
        let task: TaskPayload = match serde_json::from_slice(&plaintext) {
            Ok(task) => task,
            Err(err) => return self.abort(SessionError::Decode(err.to_string())),
        };
        self.state = SessionState::TaskInFlight;
        tracing::info!(
            target = "session",
            session_id = %self.session_id,
            kind = %task.kind,
            bytes = task.code.len(),
            "task accepted"
        );
        Ok(vec![Action::Execute(task)])
    }

    fn handle_result(&mut self, encrypted_data: &str) -> Result<Vec<Action>, SessionError> {
        if self.role != Role::Client {
            return self.abort(SessionError::Protocol {
                state: self.state,
                detail: "node received encrypted_result".into(),
            });
        }
        if self.state != SessionState::TaskInFlight {
            return self.abort(SessionError::Protocol {
                state: self.state,
                detail: "encrypted_result with no task in flight".into(),
            });
        }
        let plaintext = match self.crypto.unseal(encrypted_data) {
            Ok(plaintext) => plaintext,
            Err(err) => return self.abort(err.into()),
        };
        let result: TaskResult = match serde_json::from_slice(&plaintext) {
            Ok(result) => result,
            Err(err) => return self.abort(SessionError::Decode(err.to_string())),
        };
        self.state = SessionState::ResultSent;
        Ok(vec![Action::Deliver(result), Action::Close])
    }

    /// Client only: seal and send the task. Requires an established
    /// key; callers enforce the bounded readiness wait beforehand.
    pub fn submit_task(&mut self, task: &TaskPayload) -> Result<Vec<Action>, SessionError> {
        if self.role != Role::Client {
            return self.abort(SessionError::Protocol {
                state: self.state,
                detail: "node cannot submit a task".into(),
            });
        }
        if self.state != SessionState::KeyEstablished {
            return Err(SessionError::Protocol {
                state: self.state,
                detail: "submit before key establishment".into(),
            });
        }
        let plaintext = serde_json::to_vec(task)
            .map_err(|err| SessionError::Decode(err.to_string()))?;
        let sealed = self.crypto.seal(&plaintext)?;
        self.state = SessionState::TaskInFlight;
        Ok(vec![Action::Send(ChannelMessage::EncryptedTask {
            encrypted_data: sealed,
        })])
    }

    /// Node only: seal and send the result of the executed task, then
    /// close. One result per task, then the session is done.
    pub fn complete_task(&mut self, result: &TaskResult) -> Result<Vec<Action>, SessionError> {
        if self.role != Role::Node || self.state != SessionState::TaskInFlight {
            return self.abort(SessionError::Protocol {
                state: self.state,
                detail: "complete_task with no task in flight".into(),
            });
        }
        let plaintext = serde_json::to_vec(result)
            .map_err(|err| SessionError::Decode(err.to_string()))?;
        let sealed = self.crypto.seal(&plaintext)?;
        self.state = SessionState::ResultSent;
        tracing::info!(
            target = "session",
            session_id = %self.session_id,
            exit_code = result.exit_code,
            "result sealed and sent"
        );
        Ok(vec![
            Action::Send(ChannelMessage::EncryptedResult {
                encrypted_data: sealed,
            }),
            Action::Close,
        ])
    }

    /// Tear the session down. Idempotent: closing a closed (or failed)
    /// session is a no-op. Crypto material is discarded with `self`.
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            tracing::debug!(
                target = "session",
                session_id = %self.session_id,
                from = ?self.state,
                "session closed"
            );
            self.state = SessionState::Closed;
        }
    }

    /// Move to `Failed` and propagate the error. Every inbound-event
    /// error path funnels through here so `Failed` is truly absorbing.
    fn abort<T>(&mut self, err: SessionError) -> Result<T, SessionError> {
        tracing::warn!(
            target = "session",
            session_id = %self.session_id,
            state = ?self.state,
            error = %err,
            "session failed"
        );
        self.state = SessionState::Failed;
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EXIT_CODE_UNAVAILABLE;

    fn pair() -> (SessionStateMachine, SessionStateMachine) {
        (
            SessionStateMachine::new("s-1", Role::Client),
            SessionStateMachine::new("s-1", Role::Node),
        )
    }

    /// Feed `actions` from one side into the other, returning whatever
    /// the receiving side wants done in response.
    fn shuttle(
        actions: Vec<Action>,
        to: &mut SessionStateMachine,
    ) -> Result<Vec<Action>, SessionError> {
        let mut out = Vec::new();
        for action in actions {
            if let Action::Send(message) = action {
                out.extend(to.handle_message(message)?);
            }
        }
        Ok(out)
    }

    fn establish(client: &mut SessionStateMachine, node: &mut SessionStateMachine) {
        client.begin_signaling();
        node.begin_signaling();
        let from_client = client.on_channel_open().unwrap();
        let from_node = node.on_channel_open().unwrap();

        // Client's key reaches the node: the node just waits.
        assert!(shuttle(from_client, node).unwrap().is_empty());
        // Node's key reaches the client: client seals the session key.
        let aes_to_node = shuttle(from_node, client).unwrap();
        // Node acknowledges; ack reaches the client.
        let ack = shuttle(aes_to_node, node).unwrap();
        assert!(shuttle(ack, client).unwrap().is_empty());

        assert!(client.is_ready());
        assert!(node.is_ready());
    }

    fn sample_task() -> TaskPayload {
        TaskPayload {
            code: "print(1+1)".into(),
            kind: "python_code".into(),
        }
    }

    #[test]
    fn handshake_establishes_both_sides() {
        let (mut client, mut node) = pair();
        establish(&mut client, &mut node);
        assert_eq!(client.state(), SessionState::KeyEstablished);
        assert_eq!(node.state(), SessionState::KeyEstablished);
    }

    #[test]
    fn task_round_trip_end_to_end() {
        let (mut client, mut node) = pair();
        establish(&mut client, &mut node);

        let submit = client.submit_task(&sample_task()).unwrap();
        let node_actions = shuttle(submit, &mut node).unwrap();
        let task = match &node_actions[..] {
            [Action::Execute(task)] => task.clone(),
            other => panic!("expected execute action, got {other:?}"),
        };
        assert_eq!(task, sample_task());

        let result = TaskResult {
            exit_code: 0,
            stdout: "2\n".into(),
            stderr: String::new(),
            execution_time: 0.1,
        };
        let complete = node.complete_task(&result).unwrap();
        assert!(matches!(complete.last(), Some(Action::Close)));
        let client_actions = shuttle(complete, &mut client).unwrap();
        match &client_actions[..] {
            [Action::Deliver(delivered), Action::Close] => assert_eq!(delivered, &result),
            other => panic!("expected deliver+close, got {other:?}"),
        }
    }

    #[test]
    fn error_result_round_trip() {
        let (mut client, mut node) = pair();
        establish(&mut client, &mut node);
        let submit = client
            .submit_task(&TaskPayload {
                code: "raise RuntimeError('boom')".into(),
                kind: "python_code".into(),
            })
            .unwrap();
        shuttle(submit, &mut node).unwrap();

        let result = TaskResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "RuntimeError: boom".into(),
            execution_time: 0.1,
        };
        let client_actions = shuttle(node.complete_task(&result).unwrap(), &mut client).unwrap();
        match &client_actions[..] {
            [Action::Deliver(delivered), Action::Close] => {
                assert_eq!(delivered.exit_code, 1);
                assert!(!delivered.stderr.is_empty());
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn task_before_key_establishment_is_protocol_violation() {
        let (_, mut node) = pair();
        node.begin_signaling();
        node.on_channel_open().unwrap();
        let err = node
            .handle_message(ChannelMessage::EncryptedTask {
                encrypted_data: "AAAA".into(),
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol { .. }));
        assert_eq!(node.state(), SessionState::Failed);
    }

    #[test]
    fn tampered_task_aborts_without_reply() {
        let (mut client, mut node) = pair();
        establish(&mut client, &mut node);
        let submit = client.submit_task(&sample_task()).unwrap();
        let sealed = match &submit[..] {
            [Action::Send(ChannelMessage::EncryptedTask { encrypted_data })] => {
                // Corrupt the base64 payload body.
                let mut chars: Vec<char> = encrypted_data.chars().collect();
                chars[20] = if chars[20] == 'A' { 'B' } else { 'A' };
                chars.into_iter().collect::<String>()
            }
            other => panic!("unexpected actions {other:?}"),
        };
        let err = node
            .handle_message(ChannelMessage::EncryptedTask {
                encrypted_data: sealed,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Crypto(CryptoError::Integrity) | SessionError::Crypto(CryptoError::Decode(_))
        ));
        assert_eq!(node.state(), SessionState::Failed);
    }

    #[test]
    fn peer_key_before_channel_open_is_buffered() {
        let (mut client, mut node) = pair();
        client.begin_signaling();
        node.begin_signaling();
        let from_client = client.on_channel_open().unwrap();

        // The node sees the client's key before its own channel-open
        // event: it must buffer, not drop.
        assert!(shuttle(from_client, &mut node).unwrap().is_empty());
        let from_node = node.on_channel_open().unwrap();

        let aes_to_node = shuttle(from_node, &mut client).unwrap();
        assert!(!aes_to_node.is_empty());
        let ack = shuttle(aes_to_node, &mut node).unwrap();
        shuttle(ack, &mut client).unwrap();
        assert!(node.is_ready() && client.is_ready());
    }

    #[test]
    fn duplicate_peer_key_is_ignored() {
        let (mut client, mut node) = pair();
        client.begin_signaling();
        node.begin_signaling();
        let from_client = client.on_channel_open().unwrap();
        node.on_channel_open().unwrap();

        let pk = match &from_client[..] {
            [Action::Send(message)] => message.clone(),
            other => panic!("unexpected actions {other:?}"),
        };
        assert!(node.handle_message(pk.clone()).unwrap().is_empty());
        assert!(node.handle_message(pk).unwrap().is_empty());
        assert_eq!(node.state(), SessionState::AwaitingPeerKey);
    }

    #[test]
    fn aes_key_sent_to_client_is_rejected() {
        let (mut client, _) = pair();
        client.begin_signaling();
        client.on_channel_open().unwrap();
        let err = client
            .handle_message(
                KeyExchange::SendAesKey {
                    encrypted_aes_key: "AAAA".into(),
                }
                .into(),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol { .. }));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[test]
    fn close_is_idempotent_from_any_state() {
        let (mut client, mut node) = pair();
        client.close();
        client.close();
        assert_eq!(client.state(), SessionState::Closed);

        establish_after_close_is_noop(&mut client);

        node.begin_signaling();
        node.close();
        node.close();
        assert_eq!(node.state(), SessionState::Closed);
    }

    fn establish_after_close_is_noop(closed: &mut SessionStateMachine) {
        // Late messages after teardown are dropped, not errors.
        let actions = closed
            .handle_message(KeyExchange::AesKeyReceived.into())
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(closed.state(), SessionState::Closed);
    }

    #[test]
    fn submit_before_ready_fails_but_session_stays_closeable() {
        let (mut client, _) = pair();
        client.begin_signaling();
        let err = client.submit_task(&sample_task()).unwrap_err();
        assert!(matches!(err, SessionError::Protocol { .. }));
        // Not Failed: the caller may still tear down cleanly.
        assert_eq!(client.state(), SessionState::Signaling);
        client.close();
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[test]
    fn unavailable_result_passes_through_unchanged() {
        let (mut client, mut node) = pair();
        establish(&mut client, &mut node);
        shuttle(client.submit_task(&sample_task()).unwrap(), &mut node).unwrap();

        let result = TaskResult::unavailable("isolation runtime unavailable: docker not found", 0.0);
        let client_actions = shuttle(node.complete_task(&result).unwrap(), &mut client).unwrap();
        match &client_actions[..] {
            [Action::Deliver(delivered), Action::Close] => {
                assert_eq!(delivered.exit_code, EXIT_CODE_UNAVAILABLE);
                assert!(delivered.stderr.contains("unavailable"));
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }
}
