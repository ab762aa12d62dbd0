//! # netplay-core: Rooms and lockstep synchronization for netplay sessions
//!
//! Players and viewers meet in rooms on a central server. The server admits
//! members, aggregates per-frame input, relays negotiation payloads and keeps
//! a shared snapshot per room. Participants then run a frame-locked protocol
//! among themselves, over direct peer connections or through the server relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌───────────────┐
//! │ NetplayClient │ ◄────────────────► │ NetplayServer │
//! │ (per member)  │    Binary Proto    │ (central)     │
//! └───────┬───────┘                    └───────┬───────┘
//!         │                                    │
//!         ▼                                    ▼
//! ┌───────────────┐                    ┌───────────────┐
//! │ Lockstep      │ ◄── PeerMesh ──►   │ RoomRegistry  │ ◄── admin HTTP
//! │ Synchronizer  │    (per peer)      │ (room mutex)  │
//! └───────────────┘                    └───────┬───────┘
//!                                              │
//!                                      ┌───────┴───────┐
//!                                      │ BroadcastGroup│
//!                                      │ (per room)    │
//!                                      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded message enums)
//! - [`room`]: Per-room admission, slots and frame aggregation
//! - [`registry`]: Concurrent room service with reconnection grace
//! - [`broadcast`]: Room fan-out with audience filtering
//! - [`signaling`]: Routing of peer negotiation payloads
//! - [`latency`]: Round-trip and loss tracking
//! - [`server`]: WebSocket session server
//! - [`admin`]: Administrative HTTP surface
//! - [`client`]: WebSocket client with request/reply correlation
//! - [`mesh`]: Direct peer connections over a pluggable transport
//! - [`lockstep`]: Frame-locked input synchronization

pub mod admin;
pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod latency;
pub mod lockstep;
pub mod mesh;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod schedule;
pub mod server;
pub mod signaling;
pub mod snapshot;

// Re-exports for convenience
pub use admin::{AdminState, ApiError};
pub use auth::{Claims, TokenIssuer};
pub use broadcast::{Audience, BroadcastGroup, BroadcastStats, Envelope};
pub use client::{ConnectionState, NetplayClient, NetplayEvent, TransportError};
pub use config::{LockstepConfig, RegistryConfig, ServerConfig};
pub use error::{AuthError, RoomError};
pub use latency::{LatencyStats, PingSequencer};
pub use lockstep::{LockstepSynchronizer, PaceState, Role, Simulation, SyncOutput};
pub use mesh::{LoopbackHub, MeshError, PeerMesh, PeerTransport, TransportFactory};
pub use protocol::{
    ClientMessage, ConnectionId, InputEvent, JoinOptions, JoinedInfo, LockstepMessage, MemberInfo,
    Privacy, ProtocolError, RoomOptions, RoomSummary, ServerMessage, WireMessage,
};
pub use registry::{Membership, RoomRegistry};
pub use room::Room;
pub use schedule::{RoomTimers, ScheduledTask};
pub use server::{NetplayServer, ServerStats};
pub use signaling::SignalingRelay;
pub use snapshot::{CompressedSnapshot, SnapshotError};
