//! WebSocket client for the session server.
//!
//! Provides:
//! - Connection lifecycle with a bearer token in the handshake
//! - Request/reply correlation for create, join and list calls
//! - Automatic answers to latency pings
//! - An event stream for everything the room broadcasts
//!
//! ```text
//!   app ──► NetplayClient ──► outgoing mpsc ──► writer task ──► socket
//!   app ◄── event mpsc ◄──── reader task ◄──────────────────── socket
//!                              │ replies ──► pending oneshots
//!                              └ latency-ping ──► outgoing (pong)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::error::RoomError;
use crate::protocol::{
    ClientMessage, JoinOptions, JoinedInfo, LockstepMessage, MemberInfo, ProtocolError, RoomOptions,
    RoomSummary, ServerMessage, WireMessage,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum NetplayEvent {
    Connected,
    Disconnected,
    UserJoined(MemberInfo),
    UserLeft(MemberInfo),
    Frame {
        frame: u64,
        inputs: BTreeMap<u32, Vec<u8>>,
    },
    Predict {
        from: String,
        frame: u64,
        input: Vec<u8>,
    },
    SyncState {
        state: Vec<u8>,
        version: u64,
    },
    SpectateData {
        from: String,
        payload: Vec<u8>,
    },
    Signal {
        from: String,
        data: Vec<u8>,
    },
    /// Lockstep traffic relayed by the server.
    Lockstep {
        from: String,
        message: LockstepMessage,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("rejected: {0}")]
    Rejected(RoomError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>>;

pub struct NetplayClient {
    server_url: String,
    token: String,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Requests awaiting a reply, by request id
    pending: PendingReplies,
    next_request: AtomicU64,
    request_timeout: Duration,

    /// Last successful join
    joined: Option<JoinedInfo>,

    event_rx: Option<mpsc::Receiver<NetplayEvent>>,
    event_tx: mpsc::Sender<NetplayEvent>,
}

impl NetplayClient {
    /// Create a disconnected client for `server_url`, authenticating with
    /// a bearer `token` issued by the admin API.
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            token: token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request: AtomicU64::new(0),
            request_timeout: Duration::from_secs(10),
            joined: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// How long a request waits for its reply (default 10 s).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<NetplayEvent>> {
        self.event_rx.take()
    }

    fn url(&self) -> String {
        let sep = if self.server_url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.server_url, sep, self.token)
    }

    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.url()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(TransportError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: replies, pings and room events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            if let Some(event) = route_incoming(server_msg, &pending, &pong_tx).await {
                                let _ = event_tx.send(event).await;
                            }
                        }
                        Err(e) => log::warn!("Failed to decode server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost; fail outstanding requests
            pending.lock().await.clear();
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(NetplayEvent::Disconnected).await;
        });

        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(NetplayEvent::Connected).await;
        Ok(())
    }

    /// Close the connection. Pending requests fail.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
        self.joined = None;
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), TransportError> {
        let tx = self.outgoing_tx.as_ref().ok_or(TransportError::NotConnected)?;
        let bytes = msg.encode()?;
        tx.send(bytes).await.map_err(|_| TransportError::NotConnected)
    }

    async fn request<F>(&self, build: F) -> Result<ServerMessage, TransportError>
    where
        F: FnOnce(u64) -> ClientMessage,
    {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if let Err(e) = self.send(&build(request_id)).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(TransportError::Timeout)
            }
        }
    }

    fn expect_joined(&mut self, reply: ServerMessage) -> Result<JoinedInfo, TransportError> {
        match reply {
            ServerMessage::Joined { info, .. } => {
                self.joined = Some(info.clone());
                Ok(info)
            }
            ServerMessage::Rejected { error, .. } => Err(TransportError::Rejected(error)),
            _ => Err(ProtocolError::UnexpectedMessage.into()),
        }
    }

    /// Create a room and join it as its first player (and lockstep owner).
    pub async fn create_room(
        &mut self,
        room_id: &str,
        options: RoomOptions,
        join: JoinOptions,
    ) -> Result<JoinedInfo, TransportError> {
        let reply = self
            .request(|request_id| ClientMessage::CreateRoom {
                request_id,
                room_id: room_id.to_string(),
                options,
                join,
            })
            .await?;
        self.expect_joined(reply)
    }

    /// Join an existing room as a player or viewer. Joining with the guid
    /// of a slot still in its grace period reclaims that slot.
    pub async fn join_room(&mut self, room_id: &str, options: JoinOptions) -> Result<JoinedInfo, TransportError> {
        let reply = self
            .request(|request_id| ClientMessage::JoinRoom {
                request_id,
                room_id: room_id.to_string(),
                options,
            })
            .await?;
        self.expect_joined(reply)
    }

    /// Summaries of every room on the server.
    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, TransportError> {
        match self.request(|request_id| ClientMessage::ListRooms { request_id }).await? {
            ServerMessage::RoomList { rooms, .. } => Ok(rooms),
            _ => Err(ProtocolError::UnexpectedMessage.into()),
        }
    }

    /// Leave the current room. A player's slot is held for the grace period.
    pub async fn leave_room(&mut self) -> Result<(), TransportError> {
        self.joined = None;
        self.send(&ClientMessage::LeaveRoom).await
    }

    /// Submit this player's input for `frame` to server-side aggregation.
    pub async fn send_input(&self, frame: u64, input: Vec<u8>) -> Result<(), TransportError> {
        self.send(&ClientMessage::Input { frame, input }).await
    }

    /// Relay an input hint to the other members without aggregation.
    pub async fn send_predict(&self, frame: u64, input: Vec<u8>) -> Result<(), TransportError> {
        self.send(&ClientMessage::Predict { frame, input }).await
    }

    /// Publish a full snapshot as the room's shared state.
    pub async fn sync_state(&self, state: Vec<u8>) -> Result<(), TransportError> {
        self.send(&ClientMessage::SyncState { state }).await
    }

    /// Relay a payload to every viewer of the room.
    pub async fn send_spectate(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send(&ClientMessage::SpectateData { payload }).await
    }

    /// Relay a negotiation payload to one member, or to all others.
    pub async fn signal(&self, target: Option<String>, data: Vec<u8>) -> Result<(), TransportError> {
        self.send(&ClientMessage::Signal { target, data }).await
    }

    /// Send lockstep traffic through the server relay.
    pub async fn send_lockstep(&self, message: &LockstepMessage) -> Result<(), TransportError> {
        let payload = message.encode()?;
        self.send(&ClientMessage::Data { payload }).await
    }

    /// Current state of the socket.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Reply of the last successful create or join, until leaving.
    pub fn joined(&self) -> Option<&JoinedInfo> {
        self.joined.as_ref()
    }

    /// Whether this client holds the owner slot of its room. Survives a
    /// reconnection that reclaims the slot.
    pub fn is_owner(&self) -> bool {
        self.joined.as_ref().is_some_and(JoinedInfo::is_owner)
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Resolve replies, answer pings, and turn the rest into events.
async fn route_incoming(
    msg: ServerMessage,
    pending: &PendingReplies,
    pong_tx: &mpsc::Sender<Vec<u8>>,
) -> Option<NetplayEvent> {
    match msg {
        ServerMessage::Joined { request_id, .. }
        | ServerMessage::Rejected { request_id, .. }
        | ServerMessage::RoomList { request_id, .. } => {
            if let Some(tx) = pending.lock().await.remove(&request_id) {
                let _ = tx.send(msg);
            }
            None
        }
        ServerMessage::LatencyPing { t, seq } => {
            if let Ok(bytes) = (ClientMessage::LatencyPong { t, seq }).encode() {
                let _ = pong_tx.send(bytes).await;
            }
            None
        }
        ServerMessage::UserJoined(member) => Some(NetplayEvent::UserJoined(member)),
        ServerMessage::UserLeft(member) => Some(NetplayEvent::UserLeft(member)),
        ServerMessage::Frame { frame, inputs } => Some(NetplayEvent::Frame { frame, inputs }),
        ServerMessage::Predict { from, frame, input } => Some(NetplayEvent::Predict { from, frame, input }),
        ServerMessage::SyncState { state, version } => Some(NetplayEvent::SyncState { state, version }),
        ServerMessage::SpectateData { from, payload } => Some(NetplayEvent::SpectateData { from, payload }),
        ServerMessage::Signal { from, data } => Some(NetplayEvent::Signal { from, data }),
        ServerMessage::Data { from, payload } => match LockstepMessage::decode(&payload) {
            Ok(message) => Some(NetplayEvent::Lockstep { from, message }),
            Err(e) => {
                log::debug!("Dropping undecodable lockstep data from {from}: {e}");
                None
            }
        },
    }
}
