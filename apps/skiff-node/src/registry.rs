//! Concurrent bookkeeping of the node's live sessions.
//!
//! The registry is the only state shared across sessions: each entry
//! holds the routing handle for one session's relay signals and the
//! join handle of its driver task. All mutation goes through
//! `insert`/`lookup`/`remove`/`clear`; no session ever holds a
//! reference into another session's state.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;
use skiff_core::transport::webrtc::TransportSignal;
use tokio::sync::mpsc;

pub struct SessionHandle {
    /// Feeds relay-forwarded negotiation signals into the session's
    /// transport.
    pub signal_tx: mpsc::UnboundedSender<TransportSignal>,
    /// The session driver task; aborted when the registry is cleared.
    pub task: tokio::task::JoinHandle<()>,
    pub created_at: Instant,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Session ids must be unique among active
    /// sessions; a duplicate replaces (and aborts) the stale entry.
    pub fn insert(&self, session_id: &str, handle: SessionHandle) {
        let previous = self.inner.write().insert(session_id.to_string(), handle);
        if let Some(stale) = previous {
            tracing::warn!(
                target = "registry",
                session_id,
                age_secs = stale.created_at.elapsed().as_secs(),
                "replacing stale session with the same id"
            );
            stale.task.abort();
        }
    }

    /// Signal-routing handle for a session, if it is still active.
    /// A miss is a benign no-op for the caller: late or duplicate
    /// signals after teardown must not resurrect state.
    pub fn lookup(&self, session_id: &str) -> Option<mpsc::UnboundedSender<TransportSignal>> {
        self.inner
            .read()
            .get(session_id)
            .map(|handle| handle.signal_tx.clone())
    }

    /// Drop a finished session. Missing ids are fine (teardown is
    /// idempotent and may race with `clear`).
    pub fn remove(&self, session_id: &str) {
        self.inner.write().remove(session_id);
    }

    /// Tear down every session at once. Used when the relay connection
    /// is lost: all in-flight sessions are unreachable and none is
    /// recovered across a reconnect.
    pub fn clear(&self) {
        let drained: Vec<(String, SessionHandle)> = self.inner.write().drain().collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!(
            target = "registry",
            sessions = drained.len(),
            "clearing all sessions"
        );
        for (session_id, handle) in drained {
            tracing::debug!(
                target = "registry",
                session_id = %session_id,
                age_secs = handle.created_at.elapsed().as_secs(),
                "aborting session"
            );
            handle.task.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
