//! In-process connected transport pair.
//!
//! Two [`Transport`] halves joined by crossed channels, with the
//! ordering and close semantics of the real data channel. Used by
//! tests and by single-host loopback runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;

use super::{Transport, TransportError};

pub struct PairTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    open: Arc<AtomicBool>,
}

/// Build a connected pair. Messages sent on one half arrive on the
/// other, in order. Closing either half closes both.
pub fn pair() -> (PairTransport, PairTransport) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));
    (
        PairTransport {
            tx: Mutex::new(Some(tx_a)),
            rx: AsyncMutex::new(rx_b),
            open: open.clone(),
        },
        PairTransport {
            tx: Mutex::new(Some(tx_b)),
            rx: AsyncMutex::new(rx_a),
            open,
        },
    )
}

#[async_trait]
impl Transport for PairTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(TransportError::ChannelClosed)?;
        tx.send(data.to_vec())
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the sender wakes the peer's recv with `None`.
        self.tx.lock().take();
    }
}
