//! Direct peer connections between room participants.
//!
//! The mesh keeps one transport per remote participant. Negotiation payloads
//! are opaque to the mesh: transports produce them (`poll_signals`) and the
//! caller relays them through the server's `signal` message; the payloads the
//! relay delivers come back in through `on_signal`.
//!
//! Of two participants, the one with the lexicographically smaller identity
//! initiates. The other waits for the first incoming payload.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};
use thiserror::Error;

use crate::protocol::{LockstepMessage, ProtocolError, WireMessage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// One direct data channel to a remote participant.
pub trait PeerTransport {
    /// Advance negotiation with a payload from the remote side.
    fn apply_signal(&mut self, payload: &[u8]) -> Result<(), MeshError>;
    /// Next negotiation payload to relay to the remote side.
    fn poll_signal(&mut self) -> Option<Vec<u8>>;
    fn is_connected(&self) -> bool;
    /// Send one message. Returns false when it could not be handed over.
    fn send(&mut self, data: &[u8]) -> bool;
    fn recv(&mut self) -> Option<Vec<u8>>;
    fn close(&mut self);
}

/// Creates transports for new peers.
pub trait TransportFactory {
    type Transport: PeerTransport;

    fn create(&mut self, remote: &str, initiator: bool) -> Self::Transport;
}

struct Peer<T> {
    transport: T,
    initiator: bool,
}

pub struct PeerMesh<F: TransportFactory> {
    identity: String,
    factory: F,
    peers: HashMap<String, Peer<F::Transport>>,
}

impl<F: TransportFactory> PeerMesh<F> {
    pub fn new(identity: impl Into<String>, factory: F) -> Self {
        Self {
            identity: identity.into(),
            factory,
            peers: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// A participant entered the room. Returns true if a connection was
    /// created.
    pub fn on_participant_joined(&mut self, remote: &str) -> bool {
        if remote == self.identity || self.peers.contains_key(remote) {
            return false;
        }
        let initiator = self.identity.as_str() < remote;
        info!(
            "{} connecting to {} ({})",
            self.identity,
            remote,
            if initiator { "initiator" } else { "awaiting offer" }
        );
        let transport = self.factory.create(remote, initiator);
        self.peers.insert(remote.to_string(), Peer { transport, initiator });
        true
    }

    /// A negotiation payload arrived from `remote`.
    pub fn on_signal(&mut self, remote: &str, payload: &[u8]) {
        if remote == self.identity {
            return;
        }
        let factory = &mut self.factory;
        let peer = self.peers.entry(remote.to_string()).or_insert_with(|| Peer {
            transport: factory.create(remote, false),
            initiator: false,
        });
        if let Err(e) = peer.transport.apply_signal(payload) {
            debug!("Dropping signal from {}: {}", remote, e);
        }
    }

    pub fn on_participant_left(&mut self, remote: &str) {
        if let Some(mut peer) = self.peers.remove(remote) {
            peer.transport.close();
            info!("{} disconnected from {}", self.identity, remote);
        }
    }

    /// Serialize once and send to every connected peer. Returns the number
    /// of peers reached.
    pub fn broadcast(&mut self, message: &LockstepMessage) -> Result<usize, ProtocolError> {
        let bytes = message.encode()?;
        Ok(self.broadcast_raw(&bytes))
    }

    pub fn broadcast_raw(&mut self, bytes: &[u8]) -> usize {
        let mut sent = 0;
        for peer in self.peers.values_mut() {
            if peer.transport.is_connected() && peer.transport.send(bytes) {
                sent += 1;
            }
        }
        sent
    }

    /// Negotiation payloads waiting to be relayed, as `(target, payload)`.
    pub fn poll_signals(&mut self) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        for (remote, peer) in &mut self.peers {
            while let Some(payload) = peer.transport.poll_signal() {
                out.push((remote.clone(), payload));
            }
        }
        out
    }

    /// Messages received from peers. Undecodable payloads are dropped.
    pub fn poll_messages(&mut self) -> Vec<(String, LockstepMessage)> {
        let mut out = Vec::new();
        for (remote, peer) in &mut self.peers {
            while let Some(bytes) = peer.transport.recv() {
                match LockstepMessage::decode(&bytes) {
                    Ok(message) => out.push((remote.clone(), message)),
                    Err(e) => debug!("Dropping message from {}: {}", remote, e),
                }
            }
        }
        out
    }

    pub fn is_connected(&self, remote: &str) -> bool {
        self.peers.get(remote).is_some_and(|p| p.transport.is_connected())
    }

    pub fn is_initiator(&self, remote: &str) -> Option<bool> {
        self.peers.get(remote).map(|p| p.initiator)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.transport.is_connected()).count()
    }

    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }
}

const OFFER: &[u8] = b"offer";
const ANSWER: &[u8] = b"answer";

type Queues = HashMap<(String, String), VecDeque<Vec<u8>>>;

/// In-process exchange shared by loopback transports.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    queues: Arc<Mutex<Queues>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Factory for transports owned by `local`.
    pub fn factory(&self, local: impl Into<String>) -> LoopbackFactory {
        LoopbackFactory {
            hub: self.clone(),
            local: local.into(),
        }
    }
}

pub struct LoopbackFactory {
    hub: LoopbackHub,
    local: String,
}

impl TransportFactory for LoopbackFactory {
    type Transport = LoopbackTransport;

    fn create(&mut self, remote: &str, initiator: bool) -> LoopbackTransport {
        let mut signals = VecDeque::new();
        if initiator {
            signals.push_back(OFFER.to_vec());
        }
        LoopbackTransport {
            hub: self.hub.clone(),
            local: self.local.clone(),
            remote: remote.to_string(),
            signals,
            connected: false,
            closed: false,
        }
    }
}

/// Transport over a [`LoopbackHub`] with a two-step offer/answer handshake.
pub struct LoopbackTransport {
    hub: LoopbackHub,
    local: String,
    remote: String,
    signals: VecDeque<Vec<u8>>,
    connected: bool,
    closed: bool,
}

impl PeerTransport for LoopbackTransport {
    fn apply_signal(&mut self, payload: &[u8]) -> Result<(), MeshError> {
        if self.closed {
            return Err(MeshError::Negotiation("transport closed".into()));
        }
        if payload == OFFER {
            self.signals.push_back(ANSWER.to_vec());
        } else if payload != ANSWER {
            return Err(MeshError::Negotiation(format!("unexpected {} byte payload", payload.len())));
        }
        self.connected = true;
        Ok(())
    }

    fn poll_signal(&mut self) -> Option<Vec<u8>> {
        self.signals.pop_front()
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.closed
    }

    fn send(&mut self, data: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.hub
            .queues()
            .entry((self.local.clone(), self.remote.clone()))
            .or_default()
            .push_back(data.to_vec());
        true
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        if self.closed {
            return None;
        }
        self.hub
            .queues()
            .get_mut(&(self.remote.clone(), self.local.clone()))
            .and_then(VecDeque::pop_front)
    }

    fn close(&mut self) {
        self.closed = true;
        self.connected = false;
    }
}
