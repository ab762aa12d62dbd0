//! WebSocket session server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── RoomRegistry ── Room (Mutex)
//!             ├── conn task ──────┤                     │
//! Client B ──┘   (select loop)    │              BroadcastGroup
//!                                 │                     │
//!                                 └───── envelopes ◄────┘
//!                                        filtered by Audience
//! ```
//!
//! One tokio task per connection. The task multiplexes three sources with
//! `tokio::select!`: frames from the socket, envelopes from the joined room's
//! broadcast channel, and the latency ping interval. The handshake is
//! rejected unless it carries a valid bearer token, either as the `token`
//! query parameter or an `Authorization: Bearer` header.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::admin::AdminState;
use crate::auth::{bearer_token, TokenIssuer};
use crate::broadcast::Envelope;
use crate::config::ServerConfig;
use crate::latency::PingSequencer;
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage, WireMessage};
use crate::registry::{Membership, RoomRegistry};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

struct Shared {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    tokens: Arc<TokenIssuer>,
    stats: RwLock<ServerStats>,
    started: Instant,
}

impl Shared {
    fn now_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// The session server.
pub struct NetplayServer {
    shared: Arc<Shared>,
}

impl NetplayServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = RoomRegistry::new(config.registry.clone());
        let tokens = Arc::new(TokenIssuer::new(config.api_key.as_deref(), config.token_ttl));
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                tokens,
                stats: RwLock::new(ServerStats::default()),
                started: Instant::now(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.shared.registry
    }

    pub fn tokens(&self) -> &Arc<TokenIssuer> {
        &self.shared.tokens
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// State for the admin router, sharing this server's registry and keys.
    pub fn admin_state(&self) -> AdminState {
        AdminState {
            registry: self.shared.registry.clone(),
            tokens: self.shared.tokens.clone(),
            api_key: self.shared.config.api_key.clone(),
            admin_key: self.shared.config.admin_key.clone(),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Bind `bind_addr` and accept connections forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Netplay server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), BoxError> {
        let tokens = shared.tokens.clone();
        let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match request_token(req) {
                Some(token) if tokens.verify(token).is_ok() => Ok(resp),
                _ => {
                    let mut err = ErrorResponse::new(Some("unauthorized".to_string()));
                    *err.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(err)
                }
            }
        })
        .await;

        let ws_stream = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("Handshake rejected from {addr}: {e}");
                shared.stats.write().await.rejected_handshakes += 1;
                return Ok(());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn = ConnectionId::new();
        log::info!("WebSocket connection {conn} established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session = Session {
            conn,
            room_id: None,
            is_viewer: false,
            broadcast_rx: None,
        };
        let mut pings = PingSequencer::new();
        let period = shared.config.ping_interval;
        let mut ping_timer = tokio::time::interval_at(Instant::now() + period, period);

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = shared.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                match ClientMessage::decode(&data) {
                                    Ok(client_msg) => {
                                        session.handle(&shared, client_msg, &mut ws_sender).await?;
                                    }
                                    Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {conn} closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    envelope = async {
                        match session.broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            // Not in a room yet
                            None => std::future::pending().await,
                        }
                    } => {
                        match envelope {
                            Ok(env) => {
                                if env.audience.admits(conn, session.is_viewer) {
                                    ws_sender.send(Message::Binary(env.payload.to_vec().into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {conn} lagged by {n} messages");
                                if let Some(room_id) = &session.room_id {
                                    shared.registry.record_lagged(room_id, n).await;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                log::info!("Room {:?} closed under connection {conn}", session.room_id);
                                session.room_id = None;
                                session.broadcast_rx = None;
                            }
                        }
                    }

                    _ = ping_timer.tick() => {
                        let ping = ServerMessage::LatencyPing {
                            t: shared.now_millis(),
                            seq: pings.next_seq(),
                        };
                        send(&mut ws_sender, &ping).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        session.leave(&shared).await;
        shared.stats.write().await.active_connections -= 1;
        result
    }
}

/// Per-connection room membership.
struct Session {
    conn: ConnectionId,
    room_id: Option<String>,
    is_viewer: bool,
    broadcast_rx: Option<broadcast::Receiver<Arc<Envelope>>>,
}

impl Session {
    async fn handle(&mut self, shared: &Shared, msg: ClientMessage, ws: &mut WsSink) -> Result<(), BoxError> {
        let registry = &shared.registry;
        match msg {
            ClientMessage::CreateRoom {
                request_id,
                room_id,
                options,
                join,
            } => {
                self.leave(shared).await;
                let result = registry.create_and_join(&room_id, options, self.conn, join).await;
                self.reply_join(request_id, result, ws).await?;
            }
            ClientMessage::JoinRoom {
                request_id,
                room_id,
                options,
            } => {
                self.leave(shared).await;
                let result = registry.join_room(&room_id, self.conn, &options).await;
                self.reply_join(request_id, result, ws).await?;
            }
            ClientMessage::ListRooms { request_id } => {
                let rooms = registry.list_rooms().await;
                send(ws, &ServerMessage::RoomList { request_id, rooms }).await?;
            }
            ClientMessage::LeaveRoom => self.leave(shared).await,
            ClientMessage::LatencyPong { t, seq } => {
                if let Some(room_id) = &self.room_id {
                    let rtt = shared.now_millis().saturating_sub(t);
                    registry
                        .record_pong(room_id, self.conn, seq, std::time::Duration::from_millis(rtt))
                        .await;
                }
            }
            other => {
                let Some(room_id) = self.room_id.as_deref() else {
                    log::debug!("Connection {} sent room traffic outside a room", self.conn);
                    return Ok(());
                };
                match other {
                    ClientMessage::Input { frame, input } => {
                        registry.submit_input(room_id, self.conn, frame, input).await;
                    }
                    ClientMessage::Predict { frame, input } => {
                        registry.relay_predict(room_id, self.conn, frame, input).await;
                    }
                    ClientMessage::SyncState { state } => {
                        if let Err(e) = registry.sync_state(room_id, self.conn, state).await {
                            log::debug!("sync-state from {} refused: {}", self.conn, e);
                        }
                    }
                    ClientMessage::SpectateData { payload } => {
                        registry.relay_spectate(room_id, self.conn, payload).await;
                    }
                    ClientMessage::Signal { target, data } => {
                        registry.relay_signal(room_id, self.conn, target.as_deref(), data).await;
                    }
                    ClientMessage::Data { payload } => {
                        registry.relay_data(room_id, self.conn, payload).await;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn reply_join(
        &mut self,
        request_id: u64,
        result: Result<Membership, crate::error::RoomError>,
        ws: &mut WsSink,
    ) -> Result<(), BoxError> {
        match result {
            Ok(Membership { info, receiver }) => {
                self.room_id = Some(info.room_id.clone());
                self.is_viewer = info.spectator;
                self.broadcast_rx = Some(receiver);
                send(ws, &ServerMessage::Joined { request_id, info }).await
            }
            Err(error) => {
                log::debug!("Connection {} rejected: {}", self.conn, error);
                send(ws, &ServerMessage::Rejected { request_id, error }).await
            }
        }
    }

    async fn leave(&mut self, shared: &Shared) {
        self.broadcast_rx = None;
        self.is_viewer = false;
        if let Some(room_id) = self.room_id.take() {
            shared.registry.leave(&room_id, self.conn).await;
        }
    }
}

async fn send(ws: &mut WsSink, msg: &ServerMessage) -> Result<(), BoxError> {
    let bytes = msg.encode()?;
    ws.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

/// Bearer token from the `token` query parameter or the `Authorization`
/// header.
fn request_token(req: &Request) -> Option<&str> {
    let from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value)
    });
    from_query.or_else(|| {
        req.headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
    })
}
