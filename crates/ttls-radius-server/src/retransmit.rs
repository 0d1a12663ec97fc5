//! Access-Challenge retransmission
//!
//! RADIUS runs over UDP and a lost challenge stalls the whole EAP
//! exchange, so challenges are re-sent until the client shows signs of
//! life. Any datagram from the same `ip:port` counts as the
//! acknowledgment and cancels the pending retransmission. Terminal
//! replies are sent once.

use crate::config::RetransmitSettings;
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Encoded reply and whether it should be retransmitted until the client
/// answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub data: Vec<u8>,
    pub expect_acknowledgment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Wait before retry `attempt` (0-based): `base_delay * (attempt + 1)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (attempt + 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(600),
        }
    }
}

impl From<&RetransmitSettings> for RetryPolicy {
    fn from(settings: &RetransmitSettings) -> Self {
        RetryPolicy {
            max_retries: settings.max_retries,
            base_delay: settings.base_delay(),
        }
    }
}

struct Pending {
    generation: u64,
    cancel: oneshot::Sender<()>,
}

pub struct Retransmitter {
    socket: Arc<UdpSocket>,
    policy: RetryPolicy,
    pending: Arc<DashMap<SocketAddr, Pending>>,
    generation: AtomicU64,
}

impl Retransmitter {
    pub fn new(socket: Arc<UdpSocket>, policy: RetryPolicy) -> Self {
        Retransmitter {
            socket,
            policy,
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Sends `response` and, when it expects an acknowledgment, schedules
    /// retransmissions. A newer response to the same address replaces the
    /// older schedule.
    pub async fn send(&self, response: OutboundResponse, addr: SocketAddr) -> io::Result<()> {
        self.socket.send_to(&response.data, addr).await?;
        if !response.expect_acknowledgment || self.policy.max_retries == 0 {
            return Ok(());
        }

        let (cancel, mut cancelled) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = self.pending.insert(addr, Pending { generation, cancel }) {
            let _ = previous.cancel.send(());
        }

        let socket = Arc::clone(&self.socket);
        let pending = Arc::clone(&self.pending);
        let policy = self.policy;
        let data = response.data;

        tokio::spawn(async move {
            for attempt in 0..policy.max_retries {
                tokio::select! {
                    _ = &mut cancelled => return,
                    _ = tokio::time::sleep(policy.delay(attempt)) => {
                        debug!(client_addr = %addr, attempt = attempt + 1, "Retransmitting Access-Challenge");
                        if let Err(e) = socket.send_to(&data, addr).await {
                            warn!(client_addr = %addr, error = %e, "Retransmission failed");
                            break;
                        }
                    }
                }
            }
            pending.remove_if(&addr, |_, entry| entry.generation == generation);
        });
        Ok(())
    }

    /// Cancels the pending retransmission to `addr`, if any.
    pub fn acknowledge(&self, addr: SocketAddr) -> bool {
        match self.pending.remove(&addr) {
            Some((_, entry)) => {
                let _ = entry.cancel.send(());
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
