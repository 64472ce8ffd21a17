//! Relay connection lifecycle: bounded initial connect, unbounded
//! reconnect after an established link drops.
//!
//! Initial startup is allowed to fail for good: if the relay is
//! unreachable on the first attempts the operator should see a fatal
//! error, not a silently looping daemon. Once the node has been
//! connected at least once, loss of the relay is treated as transient
//! and retried forever.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

/// Attempts made before startup gives up.
pub const INITIAL_ATTEMPTS: u32 = 5;

const BASE_DELAY: Duration = Duration::from_secs(5);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Delay before retry number `attempt` (zero-based): 5s doubling per
/// attempt, capped at 30s. 5, 10, 20, 30, 30, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    let doubled = BASE_DELAY.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    doubled.min(MAX_DELAY)
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("relay unreachable after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Drives repeated connection attempts against a relay, pacing them
/// with [`backoff_delay`] and bailing out promptly on shutdown.
pub struct ReconnectSupervisor<C> {
    connector: C,
    shutdown: watch::Receiver<bool>,
}

impl<C, Fut, Conn, E> ReconnectSupervisor<C>
where
    C: Fn() -> Fut,
    Fut: Future<Output = Result<Conn, E>>,
    E: std::fmt::Display,
{
    pub fn new(connector: C, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            connector,
            shutdown,
        }
    }

    /// Startup connect: at most [`INITIAL_ATTEMPTS`] tries.
    pub async fn connect_initial(&mut self) -> Result<Conn, ConnectError> {
        let mut last = String::from("no attempt made");
        for attempt in 0..INITIAL_ATTEMPTS {
            match (self.connector)().await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    last = err.to_string();
                    tracing::warn!(
                        target = "supervisor",
                        attempt = attempt + 1,
                        max = INITIAL_ATTEMPTS,
                        error = %last,
                        "relay connection failed"
                    );
                }
            }
            if attempt + 1 < INITIAL_ATTEMPTS && !self.sleep_or_shutdown(backoff_delay(attempt)).await {
                break;
            }
        }
        Err(ConnectError::Exhausted {
            attempts: INITIAL_ATTEMPTS,
            last,
        })
    }

    /// Post-establishment reconnect: retries until it succeeds or the
    /// node is shut down. `None` means shutdown was requested.
    pub async fn reconnect(&mut self) -> Option<Conn> {
        let mut attempt = 0u32;
        loop {
            if *self.shutdown.borrow() {
                return None;
            }
            match (self.connector)().await {
                Ok(conn) => {
                    tracing::info!(target = "supervisor", "relay connection restored");
                    return Some(conn);
                }
                Err(err) => {
                    tracing::warn!(
                        target = "supervisor",
                        attempt = attempt + 1,
                        error = %err,
                        "relay reconnect failed"
                    );
                }
            }
            if !self.sleep_or_shutdown(backoff_delay(attempt)).await {
                return None;
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Sleeps for `delay`, returning false if shutdown was signalled
    /// before the delay elapsed.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.shutdown.changed() => match changed {
                    Ok(()) if *self.shutdown.borrow() => return false,
                    Ok(()) => {}
                    // Sender gone: shutdown can never be signalled.
                    Err(_) => {
                        sleep.as_mut().await;
                        return true;
                    }
                },
            }
        }
    }
}
