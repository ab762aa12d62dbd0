//! RoomRegistry: the authoritative store of room and session state.
//!
//! ```text
//!   RoomRegistry
//!     rooms: RwLock<HashMap<id, Arc<RoomHandle>>>
//!                                   │
//!                 ┌─────────────────┼──────────────────┐
//!                 ▼                 ▼                  ▼
//!          Mutex<Room>      BroadcastGroup        RoomTimers
//!        (all mutations)   (room fan-out)    (grace reclamation)
//! ```
//!
//! Every mutation of a room happens under that room's own mutex, and the
//! events it produces are published before the mutex is released, so each
//! room observes a single ordered stream of events. Unrelated rooms never
//! contend. The outer map lock is only held to look up, insert or remove
//! handles, and is never acquired while a room mutex is held.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

use crate::broadcast::{Audience, BroadcastGroup, BroadcastStats, Envelope};
use crate::config::RegistryConfig;
use crate::error::RoomError;
use crate::latency::LatencyStats;
use crate::protocol::{
    ConnectionId, JoinOptions, JoinedInfo, MemberInfo, RoomOptions, RoomSummary, ServerMessage,
};
use crate::room::{Admission, Departure, FrameEvent, Room};
use crate::schedule::{RoomTimers, ScheduledTask};
use crate::signaling::SignalingRelay;

/// One room plus its fan-out channel and timers.
pub struct RoomHandle {
    state: Mutex<Room>,
    broadcast: BroadcastGroup,
    timers: RoomTimers,
}

impl RoomHandle {
    fn new(room: Room, capacity: usize) -> Self {
        Self {
            state: Mutex::new(room),
            broadcast: BroadcastGroup::new(capacity),
            timers: RoomTimers::new(),
        }
    }

    fn publish(&self, audience: Audience, msg: &ServerMessage) {
        if let Err(e) = self.broadcast.send(audience, msg) {
            warn!("failed to encode broadcast: {}", e);
        }
    }

    fn publish_frames(&self, frames: Vec<FrameEvent>) {
        for FrameEvent { frame, inputs } in frames {
            log::trace!("frame {} complete with {} inputs", frame, inputs.len());
            self.publish(Audience::Everyone, &ServerMessage::Frame { frame, inputs });
        }
    }
}

/// A successful join: the reply plus the room's broadcast receiver.
pub struct Membership {
    pub info: JoinedInfo,
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
}

pub struct RoomRegistry {
    config: RegistryConfig,
    relay: SignalingRelay,
    rooms: RwLock<HashMap<String, Arc<RoomHandle>>>,
    this: Weak<RoomRegistry>,
}

impl RoomRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            relay: SignalingRelay::new(config.max_signal_bytes),
            config,
            rooms: RwLock::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    async fn handle(&self, room_id: &str) -> Option<Arc<RoomHandle>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Register a new, empty room.
    pub async fn create_room(&self, room_id: &str, options: RoomOptions) -> Result<(), RoomError> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(room_id) {
            return Err(RoomError::AlreadyExists);
        }
        let room = Room::new(room_id, options, &self.config);
        rooms.insert(
            room_id.to_string(),
            Arc::new(RoomHandle::new(room, self.config.broadcast_capacity)),
        );
        info!("Room created: {}", room_id);
        Ok(())
    }

    /// Create a room and join `conn` as its first player. The room is
    /// removed again if the creator cannot be admitted.
    pub async fn create_and_join(
        &self,
        room_id: &str,
        options: RoomOptions,
        conn: ConnectionId,
        mut request: JoinOptions,
    ) -> Result<Membership, RoomError> {
        // The creator always knows the password it just set
        request.password = options.password.clone();
        request.spectator = false;
        self.create_room(room_id, options).await?;

        match self.join_room(room_id, conn, &request).await {
            Ok(membership) => Ok(membership),
            Err(e) => {
                self.remove_if_empty(room_id).await;
                Err(e)
            }
        }
    }

    /// Admit `conn` into a room and subscribe it to the room's broadcasts.
    pub async fn join_room(
        &self,
        room_id: &str,
        conn: ConnectionId,
        request: &JoinOptions,
    ) -> Result<Membership, RoomError> {
        let handle = self.handle(room_id).await.ok_or(RoomError::NoRoom)?;
        let mut room = handle.state.lock().await;

        let admission = room.admit(request, &self.config)?;
        // Subscribe first so the joiner sees its own announcement
        let receiver = handle.broadcast.subscribe();
        let joined = room.apply(admission, conn, request);

        if let Admission::Reconnect { slot } = admission {
            handle.timers.cancel(&request.guid);
            info!("{} reclaimed slot {} in room {}", request.guid, slot, room_id);
        } else {
            info!(
                "{} joined room {} as {}",
                request.guid,
                room_id,
                joined
                    .member
                    .player
                    .map_or_else(|| "viewer".to_string(), |slot| format!("player {slot}"))
            );
        }

        let info = JoinedInfo {
            room_id: room_id.to_string(),
            player: joined.member.player,
            spectator: joined.member.spectator,
            name: joined.member.name.clone(),
            guid: joined.member.guid.clone(),
            frame: room.frame(),
            state: room.shared_state(),
            state_version: room.state_version(),
        };
        handle.publish(Audience::Everyone, &ServerMessage::UserJoined(joined.member));

        Ok(Membership { info, receiver })
    }

    /// Evaluate admission without joining. Used for availability probing.
    pub async fn probe_join(&self, room_id: &str, request: &JoinOptions) -> Result<MemberInfo, RoomError> {
        let handle = self.handle(room_id).await.ok_or(RoomError::NoRoom)?;
        let room = handle.state.lock().await;
        let admission = room.admit(request, &self.config)?;

        let (player, name) = match admission {
            Admission::Viewer => (None, request.name.clone()),
            Admission::NewPlayer { slot } => (Some(slot), request.name.clone()),
            Admission::Reconnect { slot } => (
                Some(slot),
                room.slot(&request.guid)
                    .map_or_else(|| request.name.clone(), |s| s.display_name.clone()),
            ),
        };
        Ok(MemberInfo {
            player,
            spectator: player.is_none(),
            name,
            guid: request.guid.clone(),
        })
    }

    /// Detach a connection. Viewers are removed at once; players keep their
    /// slot for the grace period.
    pub async fn leave(&self, room_id: &str, conn: ConnectionId) {
        let Some(handle) = self.handle(room_id).await else {
            return;
        };
        let empty = {
            let mut room = handle.state.lock().await;
            match room.leave(conn, Instant::now()) {
                Departure::Viewer(member) => {
                    info!("viewer {} left room {}", member.guid, room_id);
                    handle.publish(Audience::Everyone, &ServerMessage::UserLeft(member));
                }
                Departure::Player {
                    identity,
                    epoch,
                    frames,
                } => {
                    info!(
                        "{} disconnected from room {}, holding slot for {:?}",
                        identity, room_id, self.config.reconnect_grace
                    );
                    handle.publish_frames(frames);
                    self.schedule_reclaim(&handle, room_id, identity, epoch);
                }
                Departure::Unknown => {}
            }
            room.is_empty()
        };
        if empty {
            self.remove_if_empty(room_id).await;
        }
    }

    fn schedule_reclaim(&self, handle: &RoomHandle, room_id: &str, identity: String, epoch: u64) {
        let task = ScheduledTask {
            room_id: room_id.to_string(),
            identity,
            epoch,
            deadline: Instant::now() + self.config.reconnect_grace,
        };
        let registry = self.this.clone();
        handle.timers.schedule(task, move |task| async move {
            if let Some(registry) = registry.upgrade() {
                registry.reclaim(task).await;
            }
        });
    }

    /// Grace period expired: free the slot unless the identity came back.
    async fn reclaim(&self, task: ScheduledTask) {
        let Some(handle) = self.handle(&task.room_id).await else {
            debug!("reclaim for deleted room {}", task.room_id);
            return;
        };
        let empty = {
            let mut room = handle.state.lock().await;
            handle.timers.complete(&task.identity, task.epoch);
            match room.reclaim(&task.identity, task.epoch) {
                Some(member) => {
                    info!("slot {:?} in room {} reclaimed from {}", member.player, task.room_id, member.guid);
                    handle.publish(Audience::Everyone, &ServerMessage::UserLeft(member));
                }
                None => debug!("{} no longer reclaimable in {}", task.identity, task.room_id),
            }
            room.is_empty()
        };
        if empty {
            self.remove_if_empty(&task.room_id).await;
        }
    }

    async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(handle) = rooms.get(room_id).cloned() else {
            return false;
        };
        let mut room = handle.state.lock().await;
        if !room.is_empty() {
            return false;
        }
        room.close();
        handle.timers.cancel_all();
        rooms.remove(room_id);
        info!("Room {} empty, removed", room_id);
        true
    }

    /// Administrative removal, regardless of membership.
    pub async fn delete_room(&self, room_id: &str) -> Result<(), RoomError> {
        let handle = self
            .rooms
            .write()
            .await
            .remove(room_id)
            .ok_or(RoomError::RoomNotFound)?;
        handle.state.lock().await.close();
        handle.timers.cancel_all();
        info!("Room deleted: {}", room_id);
        Ok(())
    }

    /// Replace a room's shared snapshot and return the new version.
    pub async fn update_shared_state(&self, room_id: &str, state: &[u8]) -> Result<u64, RoomError> {
        let handle = self.handle(room_id).await.ok_or(RoomError::RoomNotFound)?;
        let mut room = handle.state.lock().await;
        room.update_shared_state(state, &self.config)
    }

    /// A player publishes a snapshot: store it and relay it to the others.
    pub async fn sync_state(&self, room_id: &str, conn: ConnectionId, state: Vec<u8>) -> Result<u64, RoomError> {
        let handle = self.handle(room_id).await.ok_or(RoomError::RoomNotFound)?;
        let mut room = handle.state.lock().await;
        if !room.is_member(conn) || room.is_viewer(conn) {
            return Err(RoomError::Unauthorized);
        }
        let version = room.update_shared_state(&state, &self.config)?;
        info!("room {} shared state now at version {}", room_id, version);
        handle.publish(Audience::AllExcept(conn), &ServerMessage::SyncState { state, version });
        Ok(version)
    }

    /// Buffer player input; emits every frame that became complete.
    pub async fn submit_input(&self, room_id: &str, conn: ConnectionId, frame: u64, input: Vec<u8>) -> usize {
        let Some(handle) = self.handle(room_id).await else {
            return 0;
        };
        let mut room = handle.state.lock().await;
        let frames = room.submit_input(conn, frame, input);
        let count = frames.len();
        handle.publish_frames(frames);
        count
    }

    /// Relay a prediction hint to the other members.
    pub async fn relay_predict(&self, room_id: &str, conn: ConnectionId, frame: u64, input: Vec<u8>) {
        let Some(handle) = self.handle(room_id).await else {
            return;
        };
        let room = handle.state.lock().await;
        let Some(from) = room.identity_of(conn).map(str::to_string) else {
            return;
        };
        handle.publish(
            Audience::AllExcept(conn),
            &ServerMessage::Predict { from, frame, input },
        );
    }

    /// Relay opaque data to the viewers.
    pub async fn relay_spectate(&self, room_id: &str, conn: ConnectionId, payload: Vec<u8>) {
        let Some(handle) = self.handle(room_id).await else {
            return;
        };
        let room = handle.state.lock().await;
        let Some(from) = room.identity_of(conn).map(str::to_string) else {
            return;
        };
        handle.publish(
            Audience::ViewersExcept(conn),
            &ServerMessage::SpectateData { from, payload },
        );
    }

    /// Relay a negotiation payload through the signaling relay.
    pub async fn relay_signal(&self, room_id: &str, conn: ConnectionId, target: Option<&str>, data: Vec<u8>) {
        let Some(handle) = self.handle(room_id).await else {
            return;
        };
        let room = handle.state.lock().await;
        let Some(route) = self.relay.route(&room, conn, target, data.len()) else {
            return;
        };
        debug!("room {}: signal from {} to {:?}", room_id, route.from, route.audience);
        handle.publish(route.audience, &ServerMessage::Signal { from: route.from, data });
    }

    /// Relay an encoded lockstep message to every other member.
    pub async fn relay_data(&self, room_id: &str, conn: ConnectionId, payload: Vec<u8>) {
        if payload.is_empty() || payload.len() > self.config.max_snapshot_bytes {
            debug!("room {}: dropping data of {} bytes", room_id, payload.len());
            return;
        }
        let Some(handle) = self.handle(room_id).await else {
            return;
        };
        let room = handle.state.lock().await;
        let Some(from) = room.identity_of(conn).map(str::to_string) else {
            return;
        };
        handle.publish(Audience::AllExcept(conn), &ServerMessage::Data { from, payload });
    }

    /// Feed a latency pong into the sender's stats.
    pub async fn record_pong(&self, room_id: &str, conn: ConnectionId, seq: u64, rtt: Duration) {
        if let Some(handle) = self.handle(room_id).await {
            handle.state.lock().await.record_pong(conn, seq, rtt);
        }
    }

    pub async fn latency(&self, room_id: &str, identity: &str) -> Option<LatencyStats> {
        let handle = self.handle(room_id).await?;
        let room = handle.state.lock().await;
        room.latency(identity)
    }

    pub async fn summary(&self, room_id: &str) -> Option<RoomSummary> {
        let handle = self.handle(room_id).await?;
        let room = handle.state.lock().await;
        Some(room.summary())
    }

    /// Summaries of every room, ordered by id.
    pub async fn list_rooms(&self) -> Vec<RoomSummary> {
        self.search("").await
    }

    /// Rooms whose name or id contains `query`, case-insensitively.
    pub async fn search(&self, query: &str) -> Vec<RoomSummary> {
        let needle = query.to_lowercase();
        let handles: Vec<Arc<RoomHandle>> = self.rooms.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let room = handle.state.lock().await;
            if !room.is_closed() && room.matches(&needle) {
                summaries.push(room.summary());
            }
        }
        summaries.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        summaries
    }

    pub async fn contains(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn broadcast_stats(&self, room_id: &str) -> Option<BroadcastStats> {
        Some(self.handle(room_id).await?.broadcast.stats())
    }

    /// Account for envelopes a connection lost to lag.
    pub async fn record_lagged(&self, room_id: &str, skipped: u64) {
        if let Some(handle) = self.handle(room_id).await {
            handle.broadcast.record_lagged(skipped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireMessage;

    fn registry() -> Arc<RoomRegistry> {
        RoomRegistry::new(RegistryConfig::default())
    }

    fn two_player_room() -> RoomOptions {
        RoomOptions {
            max_players: Some(2),
            max_viewers: Some(1),
            ..Default::default()
        }
    }

    async fn next(rx: &mut broadcast::Receiver<Arc<Envelope>>, conn: ConnectionId, viewer: bool) -> ServerMessage {
        loop {
            let env = rx.recv().await.unwrap();
            if env.audience.admits(conn, viewer) {
                return ServerMessage::decode(&env.payload).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_create_duplicate() {
        let reg = registry();
        reg.create_room("r1", RoomOptions::default()).await.unwrap();
        assert_eq!(
            reg.create_room("r1", RoomOptions::default()).await,
            Err(RoomError::AlreadyExists)
        );
        assert_eq!(reg.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_missing_room() {
        let reg = registry();
        let result = reg
            .join_room("nope", ConnectionId::new(), &JoinOptions::player("A", "g1"))
            .await;
        assert_eq!(result.err(), Some(RoomError::NoRoom));
    }

    #[tokio::test]
    async fn test_scenario_slots_and_capacity() {
        let reg = RoomRegistry::new(RegistryConfig::default());
        reg.create_room("r1", RoomOptions { max_players: Some(2), ..Default::default() })
            .await
            .unwrap();

        let m1 = reg.join_room("r1", ConnectionId::new(), &JoinOptions::player("A", "g1")).await.unwrap();
        let m2 = reg.join_room("r1", ConnectionId::new(), &JoinOptions::player("B", "g2")).await.unwrap();
        assert_eq!(m1.info.player, Some(1));
        assert_eq!(m2.info.player, Some(2));

        let m3 = reg.join_room("r1", ConnectionId::new(), &JoinOptions::player("C", "g3")).await;
        assert_eq!(m3.err(), Some(RoomError::RoomFull));
    }

    #[tokio::test]
    async fn test_joiner_sees_own_announcement() {
        let reg = registry();
        reg.create_room("r1", two_player_room()).await.unwrap();
        let conn = ConnectionId::new();
        let mut m = reg.join_room("r1", conn, &JoinOptions::player("A", "g1")).await.unwrap();
        match next(&mut m.receiver, conn, false).await {
            ServerMessage::UserJoined(member) => assert_eq!(member.player, Some(1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_and_join_makes_creator_slot_one() {
        let reg = registry();
        let options = RoomOptions {
            password: Some("pw".into()),
            ..Default::default()
        };
        let m = reg
            .create_and_join("r1", options, ConnectionId::new(), JoinOptions::player("Host", "h"))
            .await
            .unwrap();
        assert_eq!(m.info.player, Some(1));
        assert_eq!(m.info.frame, 0);
        assert_eq!(m.info.state_version, 0);
    }

    #[tokio::test]
    async fn test_create_and_join_rollback() {
        let reg = RoomRegistry::new(RegistryConfig {
            players_enabled: false,
            ..Default::default()
        });
        let result = reg
            .create_and_join("r1", RoomOptions::default(), ConnectionId::new(), JoinOptions::player("H", "h"))
            .await;
        assert_eq!(result.err(), Some(RoomError::PlayersDisabled));
        assert!(!reg.contains("r1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace() {
        let reg = registry();
        reg.create_room("r1", two_player_room()).await.unwrap();
        let c1 = ConnectionId::new();
        reg.join_room("r1", c1, &JoinOptions::player("A", "g1")).await.unwrap();

        reg.leave("r1", c1).await;
        assert!(reg.contains("r1").await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let m = reg.join_room("r1", ConnectionId::new(), &JoinOptions::player("A", "g1")).await.unwrap();
        assert_eq!(m.info.player, Some(1));

        // The cancelled timer never frees the slot
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(reg.contains("r1").await);
        assert_eq!(reg.summary("r1").await.unwrap().player_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_deletes_room() {
        let reg = registry();
        reg.create_room("r1", two_player_room()).await.unwrap();
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        reg.join_room("r1", c1, &JoinOptions::player("A", "g1")).await.unwrap();
        let mut watcher = reg.join_room("r1", c2, &JoinOptions::player("B", "g2")).await.unwrap();

        reg.leave("r1", c1).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        // g2 observes the departure of g1 only after the grace period
        let mut left = None;
        while let Ok(env) = watcher.receiver.try_recv() {
            if let ServerMessage::UserLeft(member) = ServerMessage::decode(&env.payload).unwrap() {
                left = Some(member);
            }
        }
        assert_eq!(left.map(|m| m.guid), Some("g1".to_string()));
        assert!(reg.latency("r1", "g1").await.is_none());

        reg.leave("r1", c2).await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!reg.contains("r1").await);
    }

    #[tokio::test]
    async fn test_viewer_leave_removes_room() {
        let reg = registry();
        reg.create_room("r1", RoomOptions { max_viewers: Some(1), ..Default::default() })
            .await
            .unwrap();
        let v = ConnectionId::new();
        let m = reg.join_room("r1", v, &JoinOptions::viewer("V", "v1")).await.unwrap();
        assert!(m.info.spectator);
        reg.leave("r1", v).await;
        assert!(!reg.contains("r1").await);
    }

    #[tokio::test]
    async fn test_frame_aggregation_scenario() {
        let reg = registry();
        reg.create_room("r1", two_player_room()).await.unwrap();
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        let mut m1 = reg.join_room("r1", c1, &JoinOptions::player("A", "g1")).await.unwrap();
        reg.join_room("r1", c2, &JoinOptions::player("B", "g2")).await.unwrap();

        assert_eq!(reg.submit_input("r1", c1, 5, vec![1]).await, 0);
        assert_eq!(reg.submit_input("r1", c2, 5, vec![2]).await, 1);

        loop {
            if let ServerMessage::Frame { frame, inputs } = next(&mut m1.receiver, c1, false).await {
                assert_eq!(frame, 5);
                assert_eq!(inputs.len(), 2);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_shared_state_versions() {
        let reg = registry();
        assert_eq!(
            reg.update_shared_state("none", b"x").await,
            Err(RoomError::RoomNotFound)
        );
        reg.create_room("r1", two_player_room()).await.unwrap();
        assert_eq!(reg.update_shared_state("r1", b"a").await, Ok(1));
        assert_eq!(reg.update_shared_state("r1", b"b").await, Ok(2));

        let m = reg.join_room("r1", ConnectionId::new(), &JoinOptions::player("A", "g1")).await.unwrap();
        assert_eq!(m.info.state, Some(b"b".to_vec()));
        assert_eq!(m.info.state_version, 2);
    }

    #[tokio::test]
    async fn test_sync_state_requires_player() {
        let reg = registry();
        reg.create_room("r1", two_player_room()).await.unwrap();
        let viewer = ConnectionId::new();
        reg.join_room("r1", viewer, &JoinOptions::viewer("V", "v1")).await.unwrap();
        assert_eq!(
            reg.sync_state("r1", viewer, vec![1]).await,
            Err(RoomError::Unauthorized)
        );
    }

    #[tokio::test]
    async fn test_probe_does_not_mutate() {
        let reg = registry();
        reg.create_room("r1", two_player_room()).await.unwrap();
        let probe = reg.probe_join("r1", &JoinOptions::player("A", "g1")).await.unwrap();
        assert_eq!(probe.player, Some(1));
        let summary = reg.summary("r1").await.unwrap();
        assert_eq!(summary.player_count, 0);
        assert_eq!(reg.probe_join("x", &JoinOptions::default()).await, Err(RoomError::NoRoom));
    }

    #[tokio::test]
    async fn test_delete_room_closes_and_rejects_joins() {
        let reg = registry();
        reg.create_room("r1", two_player_room()).await.unwrap();
        let c1 = ConnectionId::new();
        let mut m = reg.join_room("r1", c1, &JoinOptions::player("A", "g1")).await.unwrap();

        reg.delete_room("r1").await.unwrap();
        assert_eq!(reg.delete_room("r1").await, Err(RoomError::RoomNotFound));
        assert_eq!(
            reg.join_room("r1", ConnectionId::new(), &JoinOptions::player("B", "g2")).await.err(),
            Some(RoomError::NoRoom)
        );

        // Drain the join announcement, then the channel reports closure
        let _ = m.receiver.recv().await;
        assert!(matches!(
            m.receiver.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_search() {
        let reg = registry();
        reg.create_room("alpha", RoomOptions { room_name: Some("Mario Kart".into()), ..Default::default() })
            .await
            .unwrap();
        reg.create_room("beta", RoomOptions::default()).await.unwrap();

        assert_eq!(reg.list_rooms().await.len(), 2);
        let found = reg.search("mario").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].room_id, "alpha");
        assert_eq!(reg.search("BET").await[0].room_id, "beta");
    }

    #[tokio::test]
    async fn test_latency_recorded() {
        let reg = registry();
        reg.create_room("r1", two_player_room()).await.unwrap();
        let c1 = ConnectionId::new();
        reg.join_room("r1", c1, &JoinOptions::player("A", "g1")).await.unwrap();
        reg.record_pong("r1", c1, 1, Duration::from_millis(30)).await;
        reg.record_pong("r1", c1, 4, Duration::from_millis(50)).await;

        let stats = reg.latency("r1", "g1").await.unwrap();
        assert_eq!(stats.lost_count(), 2);
        assert_eq!(stats.average(), Some(Duration::from_millis(40)));
    }
}
