//! Binary wire protocol for room coordination and lockstep traffic.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message:
//!
//! ```text
//!  client ──► server   ClientMessage   create-room / join-room / list-rooms /
//!                                      leave / input / predict / sync-state /
//!                                      spectate-data / signal / data / latency-pong
//!  server ──► client   ServerMessage   joined / rejected / room-list /
//!                                      user-joined / user-left / frame / predict /
//!                                      sync-state / spectate-data / signal /
//!                                      data / latency-ping
//!  peer   ──► peer     LockstepMessage input / short-pause / sync / state /
//!                                      ready / readyready / restart / pause / play
//! ```
//!
//! Enum discriminants are bincode varints, so the common `input` message is a
//! handful of header bytes plus the payload. Shapes are validated here, at the
//! boundary, before anything reaches the registry or the synchronizer.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::RoomError;

/// Transient identifier of one live socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room visibility in public listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    #[default]
    Public,
    Unlisted,
}

/// Options supplied when a room is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomOptions {
    /// Display name (defaults to the room id)
    pub room_name: Option<String>,
    /// Join secret; empty string counts as none
    pub password: Option<String>,
    pub privacy: Privacy,
    /// Player capacity (defaults to the registry default)
    pub max_players: Option<u32>,
    /// Viewer capacity (defaults to the registry default)
    pub max_viewers: Option<u32>,
    /// Identity allow-list; `None` admits everyone
    pub allowed_users: Option<Vec<String>>,
}

/// Options supplied when joining a room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinOptions {
    /// Ask for a viewer seat even if a player slot is free
    pub spectator: bool,
    pub password: Option<String>,
    /// Display name shown to other members
    pub name: String,
    /// Persistent identity, stable across reconnects
    pub guid: String,
}

impl JoinOptions {
    pub fn player(name: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            spectator: false,
            password: None,
            name: name.into(),
            guid: guid.into(),
        }
    }

    pub fn viewer(name: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            spectator: true,
            ..Self::player(name, guid)
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Slot of the lockstep owner.
pub const OWNER_SLOT: u32 = 1;

/// Successful join reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedInfo {
    pub room_id: String,
    /// Slot number, `None` for viewers
    pub player: Option<u32>,
    pub spectator: bool,
    pub name: String,
    pub guid: String,
    /// Last frame with fully collected input
    pub frame: u64,
    /// Last shared snapshot, uncompressed
    pub state: Option<Vec<u8>>,
    pub state_version: u64,
}

impl JoinedInfo {
    /// Slot 1 carries lockstep authority, whoever created the room.
    pub fn is_owner(&self) -> bool {
        self.player == Some(OWNER_SLOT)
    }
}

/// Membership change payload for `user-joined` / `user-left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub player: Option<u32>,
    pub spectator: bool,
    pub name: String,
    pub guid: String,
}

/// One player as shown in a room summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSummary {
    pub slot: u32,
    pub name: String,
    pub connected: bool,
    /// Rolling average round trip in milliseconds
    pub latency_ms: Option<u64>,
}

/// Public view of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: String,
    pub room_name: String,
    /// Empty for password-protected or unlisted rooms
    pub players: Vec<PlayerSummary>,
    /// Viewer display names; empty for password-protected or unlisted rooms
    pub viewers: Vec<String>,
    pub player_count: u32,
    pub viewer_count: u32,
    pub max_players: u32,
    pub max_viewers: u32,
    pub password_protected: bool,
    pub privacy: Privacy,
}

/// Messages sent by a client to the session server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Create a room and join it as its first player.
    CreateRoom {
        request_id: u64,
        room_id: String,
        options: RoomOptions,
        join: JoinOptions,
    },
    JoinRoom {
        request_id: u64,
        room_id: String,
        options: JoinOptions,
    },
    ListRooms {
        request_id: u64,
    },
    LeaveRoom,
    /// Player input for one frame, aggregated by the server.
    Input { frame: u64, input: Vec<u8> },
    /// Low-latency hint relayed to the other members as-is.
    Predict { frame: u64, input: Vec<u8> },
    /// Full snapshot to store as the room's shared state.
    SyncState { state: Vec<u8> },
    /// Opaque payload for viewers.
    SpectateData { payload: Vec<u8> },
    /// Transport negotiation payload; `None` target means every other member.
    Signal { target: Option<String>, data: Vec<u8> },
    /// Encoded `LockstepMessage`, relayed to every other member until a
    /// direct peer channel exists.
    Data { payload: Vec<u8> },
    LatencyPong { t: u64, seq: u64 },
}

/// Messages sent by the session server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Joined {
        request_id: u64,
        info: JoinedInfo,
    },
    Rejected {
        request_id: u64,
        error: RoomError,
    },
    RoomList {
        request_id: u64,
        rooms: Vec<RoomSummary>,
    },
    UserJoined(MemberInfo),
    UserLeft(MemberInfo),
    /// All players' input for one frame, keyed by slot.
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
    Data {
        from: String,
        payload: Vec<u8>,
    },
    LatencyPing {
        t: u64,
        seq: u64,
    },
}

/// A simulated controller event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEvent {
    /// Controller index (slot - 1)
    pub player: u32,
    /// Button or axis index
    pub index: u32,
    pub value: i32,
}

/// Peer-to-peer lockstep messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LockstepMessage {
    /// Input tagged with the frame it applies to. An empty event list is a
    /// placeholder that only keeps the stream flowing.
    Input {
        owner: bool,
        frame: u64,
        events: Vec<InputEvent>,
    },
    /// Everyone pauses briefly; `by` names the straggler.
    ShortPause { by: String },
    /// Follower cannot advance and asks the owner for a snapshot.
    Sync,
    /// Owner snapshot, loaded by every recipient.
    State { state: Vec<u8> },
    /// Snapshot loaded.
    Ready,
    /// All participants ready; reset and resume.
    ReadyReady,
    Restart,
    Pause,
    Play,
}

/// Encode/decode for every wire enum.
pub trait WireMessage: Serialize + DeserializeOwned + Sized {
    /// Serialize to binary wire format.
    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

impl WireMessage for ClientMessage {}
impl WireMessage for ServerMessage {}
impl WireMessage for LockstepMessage {}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Unexpected message")]
    UnexpectedMessage,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_roundtrip() {
        let msg = ClientMessage::JoinRoom {
            request_id: 7,
            room_id: "r1".into(),
            options: JoinOptions::player("Alice", "g1").with_password("pw"),
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_owner_is_slot_one() {
        let mut info = JoinedInfo {
            room_id: "r1".into(),
            player: Some(1),
            spectator: false,
            name: "Alice".into(),
            guid: "g1".into(),
            frame: 0,
            state: None,
            state_version: 0,
        };
        assert!(info.is_owner());
        info.player = Some(2);
        assert!(!info.is_owner());
        info.player = None;
        info.spectator = true;
        assert!(!info.is_owner());
    }

    #[test]
    fn test_rejected_carries_reason() {
        let msg = ServerMessage::Rejected {
            request_id: 3,
            error: RoomError::BadPassword,
        };
        match ServerMessage::decode(&msg.encode().unwrap()).unwrap() {
            ServerMessage::Rejected { request_id, error } => {
                assert_eq!(request_id, 3);
                assert_eq!(error.reason(), "bad-password");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_frame_inputs_keep_slot_order() {
        let mut inputs = BTreeMap::new();
        inputs.insert(2, vec![2]);
        inputs.insert(1, vec![1]);
        let msg = ServerMessage::Frame { frame: 5, inputs };

        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        let ServerMessage::Frame { frame, inputs } = decoded else {
            panic!("expected frame");
        };
        assert_eq!(frame, 5);
        assert_eq!(inputs.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_input_size_efficient() {
        let msg = ClientMessage::Input {
            frame: 1000,
            input: vec![0u8; 8],
        };
        let encoded = msg.encode().unwrap();
        // variant + varint frame + length + payload
        assert!(encoded.len() < 16, "input message is {} bytes", encoded.len());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = LockstepMessage::decode(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::DeserializationError(_))));
    }

    #[test]
    fn test_room_options_json_defaults() {
        let options: RoomOptions = serde_json::from_str(r#"{"max_players": 4}"#).unwrap();
        assert_eq!(options.max_players, Some(4));
        assert_eq!(options.privacy, Privacy::Public);
        assert!(options.password.is_none());
    }

    #[test]
    fn test_connection_ids_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
