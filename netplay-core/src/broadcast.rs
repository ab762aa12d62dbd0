//! Room-scoped fan-out with audience filtering.
//!
//! Every room owns one tokio broadcast channel. A message is encoded once,
//! wrapped in an [`Envelope`] naming its audience, and sent to every
//! subscriber; each connection task drops envelopes not addressed to it.
//!
//! ```text
//!                ┌──────────────┐
//!   encode once  │ BroadcastGroup│──► rx(conn A)  admits? ──► socket A
//!   ───────────► │  (tokio bcast)│──► rx(conn B)  admits? ──► socket B
//!                └──────────────┘──► rx(conn C)  admits? ──► socket C
//! ```
//!
//! Delivery per sender is FIFO because the channel is. Lagging receivers
//! lose the oldest envelopes; the lockstep resync handshake recovers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{ConnectionId, ProtocolError, ServerMessage, WireMessage};

/// Who an envelope is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    AllExcept(ConnectionId),
    Only(ConnectionId),
    /// Viewers only, minus the sender.
    ViewersExcept(ConnectionId),
}

impl Audience {
    pub fn admits(&self, conn: ConnectionId, is_viewer: bool) -> bool {
        match *self {
            Audience::Everyone => true,
            Audience::AllExcept(sender) => conn != sender,
            Audience::Only(target) => conn == target,
            Audience::ViewersExcept(sender) => is_viewer && conn != sender,
        }
    }
}

/// One encoded `ServerMessage` with its audience.
#[derive(Debug)]
pub struct Envelope {
    pub audience: Audience,
    pub payload: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

/// Lock-free counters on the send path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many envelopes a receiver can fall behind before
    /// it starts losing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    /// Encode and send. Returns the number of receivers.
    pub fn send(&self, audience: Audience, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.send_raw(audience, Arc::new(encoded)))
    }

    /// Send pre-encoded bytes.
    pub fn send_raw(&self, audience: Audience, payload: Arc<Vec<u8>>) -> usize {
        let envelope = Arc::new(Envelope { audience, payload });
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(envelope) {
            Ok(count) => count,
            Err(_) => {
                // No subscribers
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Record envelopes a receiver lost to lag.
    pub fn record_lagged(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
