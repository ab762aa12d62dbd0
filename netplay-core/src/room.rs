//! Pure per-room state machine.
//!
//! A `Room` holds a deliberate two-level index of its players:
//!
//! ```text
//!   players     ConnectionId ──► identity      (live routing, one per socket)
//!   identities  identity     ──► PlayerSlot    (continuity, outlives sockets)
//! ```
//!
//! The room never touches sockets, timers or channels. Every mutation returns
//! the events the caller must publish, so the registry can hold the room lock
//! for the whole mutation and fan the events out afterwards.
//!
//! Admission is split in two steps: [`Room::admit`] evaluates the join rules
//! without side effects, [`Room::apply`] commits the decision. Availability
//! probing only runs the first step.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, trace};
use tokio::time::Instant;

use crate::config::RegistryConfig;
use crate::error::RoomError;
use crate::latency::LatencyStats;
use crate::protocol::{
    ConnectionId, JoinOptions, MemberInfo, PlayerSummary, Privacy, RoomOptions, RoomSummary,
};
use crate::snapshot::CompressedSnapshot;

/// Continuity record for one persistent identity.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSlot {
    pub slot: u32,
    pub display_name: String,
    pub identity: String,
    /// Live connection, cleared on disconnect
    pub connection: Option<ConnectionId>,
    pub disconnected_at: Option<Instant>,
    /// Bumped on every disconnect and reconnect; reclamation must match it
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerInfo {
    pub display_name: String,
    pub identity: String,
}

/// Outcome of the admission rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Viewer,
    /// Identity already holds `slot`.
    Reconnect { slot: u32 },
    NewPlayer { slot: u32 },
}

/// Result of committing an admission.
#[derive(Debug, Clone, PartialEq)]
pub struct Joined {
    pub member: MemberInfo,
    /// Previous live connection of the same identity, now detached
    pub replaced: Option<ConnectionId>,
}

/// Result of a connection leaving.
#[derive(Debug, Clone, PartialEq)]
pub enum Departure {
    /// Viewer removed; announce immediately.
    Viewer(MemberInfo),
    /// Player detached; the slot is held until `epoch` is reclaimed.
    Player {
        identity: String,
        epoch: u64,
        frames: Vec<FrameEvent>,
    },
    /// Connection was not a member (or was already replaced).
    Unknown,
}

/// All players' input for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEvent {
    pub frame: u64,
    pub inputs: BTreeMap<u32, Vec<u8>>,
}

/// One room: admission, slots, frame aggregation and the shared snapshot.
pub struct Room {
    id: String,
    name: String,
    password: Option<String>,
    privacy: Privacy,
    max_players: u32,
    max_viewers: u32,
    allowed_users: Option<BTreeSet<String>>,

    players: HashMap<ConnectionId, String>,
    viewers: HashMap<ConnectionId, ViewerInfo>,
    identities: HashMap<String, PlayerSlot>,
    stats: HashMap<String, LatencyStats>,

    frame: u64,
    last_emitted: Option<u64>,
    pending_inputs: BTreeMap<u64, BTreeMap<u32, Vec<u8>>>,
    max_pending_frames: usize,

    snapshot: Option<CompressedSnapshot>,
    state_version: u64,
    closed: bool,
}

impl Room {
    /// Empty room; unset options fall back to the registry defaults.
    pub fn new(id: impl Into<String>, options: RoomOptions, config: &RegistryConfig) -> Self {
        let id = id.into();
        Self {
            name: options.room_name.unwrap_or_else(|| id.clone()),
            id,
            password: options.password.filter(|p| !p.is_empty()),
            privacy: options.privacy,
            max_players: options
                .max_players
                .filter(|&n| n > 0)
                .unwrap_or(config.default_max_players),
            max_viewers: options.max_viewers.unwrap_or(config.default_max_viewers),
            allowed_users: options.allowed_users.map(|list| list.into_iter().collect()),
            players: HashMap::new(),
            viewers: HashMap::new(),
            identities: HashMap::new(),
            stats: HashMap::new(),
            frame: 0,
            last_emitted: None,
            pending_inputs: BTreeMap::new(),
            max_pending_frames: config.max_pending_frames.max(1),
            snapshot: None,
            state_version: 0,
            closed: false,
        }
    }

    /// Room identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Highest frame emitted with complete input.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Version of the stored shared snapshot, 0 before the first one.
    pub fn state_version(&self) -> u64 {
        self.state_version
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the room deleted; later admissions fail with `NoRoom`.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// No players, viewers or held identities remain.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty() && self.viewers.is_empty() && self.identities.is_empty()
    }

    /// Players with a live connection.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Connected viewers.
    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Slot held by `identity`, connected or within its grace period.
    pub fn slot(&self, identity: &str) -> Option<&PlayerSlot> {
        self.identities.get(identity)
    }

    /// Copy of the latency stats for a player identity.
    pub fn latency(&self, identity: &str) -> Option<LatencyStats> {
        self.stats.get(identity).cloned()
    }

    pub fn is_viewer(&self, conn: ConnectionId) -> bool {
        self.viewers.contains_key(&conn)
    }

    /// Connection is bound to a player slot or a viewer seat.
    pub fn is_member(&self, conn: ConnectionId) -> bool {
        self.players.contains_key(&conn) || self.viewers.contains_key(&conn)
    }

    /// Persistent identity behind a live connection.
    pub fn identity_of(&self, conn: ConnectionId) -> Option<&str> {
        self.players
            .get(&conn)
            .map(String::as_str)
            .or_else(|| self.viewers.get(&conn).map(|v| v.identity.as_str()))
    }

    /// Live connection currently bound to `identity`.
    pub fn connection_of(&self, identity: &str) -> Option<ConnectionId> {
        if let Some(conn) = self.identities.get(identity).and_then(|s| s.connection) {
            return Some(conn);
        }
        self.viewers
            .iter()
            .find(|(_, v)| v.identity == identity)
            .map(|(conn, _)| *conn)
    }

    /// Evaluate the join rules in order without mutating the room.
    pub fn admit(&self, request: &JoinOptions, config: &RegistryConfig) -> Result<Admission, RoomError> {
        if self.closed {
            return Err(RoomError::NoRoom);
        }
        if let Some(password) = &self.password {
            if request.password.as_deref() != Some(password.as_str()) {
                return Err(RoomError::BadPassword);
            }
        }
        if let Some(allowed) = &self.allowed_users {
            if !allowed.contains(&request.guid) {
                return Err(RoomError::NotAllowed);
            }
        }

        let existing = self.identities.get(&request.guid);
        let at_capacity = self.identities.len() >= self.max_players as usize;

        if request.spectator || (at_capacity && existing.is_none()) {
            if !config.viewers_enabled {
                return Err(RoomError::ViewersDisabled);
            }
            if self.viewers.len() >= self.max_viewers as usize {
                return Err(RoomError::RoomFull);
            }
            return Ok(Admission::Viewer);
        }

        if !config.players_enabled {
            return Err(RoomError::PlayersDisabled);
        }
        match existing {
            Some(slot) => Ok(Admission::Reconnect { slot: slot.slot }),
            None => Ok(Admission::NewPlayer {
                slot: self.lowest_free_slot(),
            }),
        }
    }

    /// Commit an admission previously returned by [`Room::admit`].
    pub fn apply(&mut self, admission: Admission, conn: ConnectionId, request: &JoinOptions) -> Joined {
        match admission {
            Admission::Viewer => {
                self.viewers.insert(
                    conn,
                    ViewerInfo {
                        display_name: request.name.clone(),
                        identity: request.guid.clone(),
                    },
                );
                Joined {
                    member: MemberInfo {
                        player: None,
                        spectator: true,
                        name: request.name.clone(),
                        guid: request.guid.clone(),
                    },
                    replaced: None,
                }
            }
            Admission::Reconnect { slot } | Admission::NewPlayer { slot } => {
                let entry = self
                    .identities
                    .entry(request.guid.clone())
                    .or_insert_with(|| PlayerSlot {
                        slot,
                        display_name: request.name.clone(),
                        identity: request.guid.clone(),
                        connection: None,
                        disconnected_at: None,
                        epoch: 0,
                    });

                let replaced = entry.connection.replace(conn);
                if entry.disconnected_at.take().is_some() {
                    entry.epoch += 1;
                }
                let member = MemberInfo {
                    player: Some(entry.slot),
                    spectator: false,
                    name: entry.display_name.clone(),
                    guid: entry.identity.clone(),
                };

                if let Some(old) = replaced {
                    debug!("room {}: {} took over slot {} from {}", self.id, conn, slot, old);
                    self.players.remove(&old);
                }
                self.players.insert(conn, request.guid.clone());
                self.stats.entry(request.guid.clone()).or_default();

                Joined { member, replaced }
            }
        }
    }

    /// Detach a connection. Players keep their slot until reclaimed.
    pub fn leave(&mut self, conn: ConnectionId, now: Instant) -> Departure {
        if let Some(viewer) = self.viewers.remove(&conn) {
            return Departure::Viewer(MemberInfo {
                player: None,
                spectator: true,
                name: viewer.display_name,
                guid: viewer.identity,
            });
        }

        let Some(identity) = self.players.remove(&conn) else {
            return Departure::Unknown;
        };
        let Some(entry) = self.identities.get_mut(&identity) else {
            return Departure::Unknown;
        };
        if entry.connection != Some(conn) {
            return Departure::Unknown;
        }
        entry.connection = None;
        entry.disconnected_at = Some(now);
        entry.epoch += 1;
        let epoch = entry.epoch;

        // The departed slot no longer gates aggregation
        let frames = self.drain_complete_frames();
        Departure::Player {
            identity,
            epoch,
            frames,
        }
    }

    /// Free a slot whose grace period ran out. Returns `None` when the
    /// identity reconnected or was already reclaimed since `epoch`.
    pub fn reclaim(&mut self, identity: &str, epoch: u64) -> Option<MemberInfo> {
        let entry = self.identities.get(identity)?;
        if entry.connection.is_some() || entry.epoch != epoch {
            return None;
        }
        let entry = self.identities.remove(identity)?;
        self.stats.remove(identity);
        Some(MemberInfo {
            player: Some(entry.slot),
            spectator: false,
            name: entry.display_name,
            guid: entry.identity,
        })
    }

    /// Buffer one player's input and emit every frame that became complete.
    pub fn submit_input(&mut self, conn: ConnectionId, frame: u64, input: Vec<u8>) -> Vec<FrameEvent> {
        let Some(slot) = self
            .players
            .get(&conn)
            .and_then(|identity| self.identities.get(identity))
            .map(|entry| entry.slot)
        else {
            debug!("room {}: input from non-player {}", self.id, conn);
            return Vec::new();
        };
        if self.last_emitted.is_some_and(|last| frame <= last) {
            trace!("room {}: stale input for frame {} from slot {}", self.id, frame, slot);
            return Vec::new();
        }

        self.pending_inputs.entry(frame).or_default().insert(slot, input);
        let events = self.drain_complete_frames();

        while self.pending_inputs.len() > self.max_pending_frames {
            if let Some((oldest, _)) = self.pending_inputs.pop_first() {
                trace!("room {}: dropping incomplete frame {} over the pending limit", self.id, oldest);
                self.last_emitted = Some(self.last_emitted.map_or(oldest, |last| last.max(oldest)));
            }
        }
        events
    }

    /// Emit complete frames up to the highest complete one, in order.
    /// Incomplete frames below it are abandoned.
    fn drain_complete_frames(&mut self) -> Vec<FrameEvent> {
        let live: BTreeSet<u32> = self
            .identities
            .values()
            .filter(|entry| entry.connection.is_some())
            .map(|entry| entry.slot)
            .collect();
        if live.is_empty() {
            return Vec::new();
        }

        let is_complete = |inputs: &BTreeMap<u32, Vec<u8>>| live.iter().all(|s| inputs.contains_key(s));
        let Some(highest) = self
            .pending_inputs
            .iter()
            .rev()
            .find(|(_, inputs)| is_complete(inputs))
            .map(|(frame, _)| *frame)
        else {
            return Vec::new();
        };

        let rest = self.pending_inputs.split_off(&(highest + 1));
        let done = std::mem::replace(&mut self.pending_inputs, rest);

        let mut events = Vec::new();
        for (frame, inputs) in done {
            if is_complete(&inputs) {
                events.push(FrameEvent { frame, inputs });
            } else {
                trace!("room {}: abandoning incomplete frame {}", self.id, frame);
            }
        }
        self.frame = self.frame.max(highest);
        self.last_emitted = Some(highest);
        events
    }

    /// Frames still waiting on some player.
    pub fn pending_frames(&self) -> usize {
        self.pending_inputs.len()
    }

    /// Store a new shared snapshot and return its version.
    pub fn update_shared_state(&mut self, state: &[u8], config: &RegistryConfig) -> Result<u64, RoomError> {
        let version = self.state_version + 1;
        let snapshot = CompressedSnapshot::compress(version, state, config.max_snapshot_bytes)
            .map_err(|_| RoomError::SnapshotTooLarge)?;
        self.snapshot = Some(snapshot);
        self.state_version = version;
        Ok(version)
    }

    /// Uncompressed shared snapshot, if any.
    pub fn shared_state(&self) -> Option<Vec<u8>> {
        let snapshot = self.snapshot.as_ref()?;
        match snapshot.decompress() {
            Ok(state) => Some(state),
            Err(e) => {
                log::error!("room {}: stored snapshot unreadable: {}", self.id, e);
                None
            }
        }
    }

    /// Feed a latency pong from a live player connection.
    pub fn record_pong(&mut self, conn: ConnectionId, seq: u64, rtt: std::time::Duration) -> bool {
        let Some(identity) = self.players.get(&conn) else {
            return false;
        };
        match self.stats.get_mut(identity) {
            Some(stats) => {
                stats.record(seq, rtt);
                true
            }
            None => false,
        }
    }

    pub fn summary(&self) -> RoomSummary {
        let hide_members = self.password.is_some() || self.privacy == Privacy::Unlisted;

        let mut players: Vec<PlayerSummary> = Vec::new();
        let mut viewers: Vec<String> = Vec::new();
        if !hide_members {
            players = self
                .identities
                .values()
                .map(|entry| PlayerSummary {
                    slot: entry.slot,
                    name: entry.display_name.clone(),
                    connected: entry.connection.is_some(),
                    latency_ms: self
                        .stats
                        .get(&entry.identity)
                        .and_then(LatencyStats::average)
                        .map(|d| d.as_millis() as u64),
                })
                .collect();
            players.sort_by_key(|p| p.slot);
            viewers = self.viewers.values().map(|v| v.display_name.clone()).collect();
            viewers.sort();
        }

        RoomSummary {
            room_id: self.id.clone(),
            room_name: self.name.clone(),
            players,
            viewers,
            player_count: self.identities.len() as u32,
            viewer_count: self.viewers.len() as u32,
            max_players: self.max_players,
            max_viewers: self.max_viewers,
            password_protected: self.password.is_some(),
            privacy: self.privacy,
        }
    }

    /// Case-insensitive match on room name or id. `needle` must be lowercase.
    pub fn matches(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle) || self.id.to_lowercase().contains(needle)
    }

    fn lowest_free_slot(&self) -> u32 {
        let taken: BTreeSet<u32> = self.identities.values().map(|e| e.slot).collect();
        (1..).find(|n| !taken.contains(n)).unwrap_or(1)
    }
}
