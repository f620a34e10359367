//! Connect-with-retry
//!
//! Peers start listening at different times, so a refused connect is
//! normal during startup. The loop retries transient failures with a fixed
//! backoff until it succeeds, the policy's time budget runs out or the
//! caller cancels.

use std::time::{Duration, Instant};

use backoff::backoff::{Backoff, Constant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Connection, Transport};
use crate::error::{Error, Result};
use crate::protocol::PeerAddress;

/// Bounds for [`connect_with_retry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts
    pub interval: Duration,
    /// Total time budget, `None` retries forever
    pub max_wait: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            max_wait: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(interval: Duration, max_wait: Option<Duration>) -> Self {
        Self { interval, max_wait }
    }

    fn backoff(&self) -> Constant {
        Constant::new(self.interval)
    }
}

/// Connect to `addr`, retrying transient failures
///
/// Non-transient errors propagate on the first occurrence.
pub async fn connect_with_retry(
    transport: &dyn Transport,
    addr: &PeerAddress,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Box<dyn Connection>> {
    let started = Instant::now();
    let mut backoff = policy.backoff();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let err = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled { addr: addr.clone() }),
            result = transport.connect(addr) => match result {
                Ok(conn) => {
                    if attempt > 1 {
                        debug!(peer = %addr, attempt, "Connected after retry");
                    }
                    return Ok(conn);
                }
                Err(e) => e,
            },
        };

        if !err.is_transient() {
            return Err(err);
        }

        let delay = backoff.next_backoff().unwrap_or(policy.interval);
        if let Some(max_wait) = policy.max_wait {
            if started.elapsed() + delay > max_wait {
                return Err(Error::ConnectTimeout {
                    addr: addr.clone(),
                    waited: started.elapsed(),
                });
            }
        }

        debug!(peer = %addr, attempt, error = %err, "Peer not ready, retrying");

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled { addr: addr.clone() }),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
