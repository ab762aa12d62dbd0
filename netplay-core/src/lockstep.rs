//! Frame-locked input synchronization between room participants.
//!
//! One participant is the **owner** and paces the session; everyone else is a
//! **follower**. Local input is pre-dated by a look-ahead window so peers have
//! buffered it before they reach that frame.
//!
//! ```text
//!  owner tick c:    apply local input at c ─► next tick: Input{frame: c + L}
//!  follower tick c: buffer[c] present? ─ yes ─► apply, keep running
//!                                     └─ no ──► pause, send Sync
//!
//!  resync:  follower ─Sync─► owner ─State─► all ─Ready─► owner ─ReadyReady─► all
//! ```
//!
//! The synchronizer performs no I/O. It is driven once per completed
//! simulation tick and once per arriving message, and queues its outgoing
//! traffic for the caller to drain (`drain_outputs`) and hand to a
//! [`PeerMesh`](crate::mesh::PeerMesh) or the server relay.

use std::collections::{BTreeMap, HashSet};

use log::{debug, info, trace};
use tokio::time::Instant;

use crate::config::LockstepConfig;
use crate::protocol::{InputEvent, LockstepMessage};

/// The emulated machine driven by the synchronizer.
pub trait Simulation {
    /// Absolute frame counter, monotonically increasing while running.
    fn frame(&self) -> u64;
    fn apply_input(&mut self, event: &InputEvent);
    fn snapshot(&self) -> Vec<u8>;
    fn load_snapshot(&mut self, state: &[u8]);
    fn pause(&mut self);
    fn play(&mut self);
    fn restart(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Follower,
}

/// Pacing state of the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceState {
    Running,
    /// Follower without input for its frame, or anyone inside a resync
    WaitingForSync,
    /// Transient stall-recovery pause
    ShortPause,
}

/// Traffic produced by the synchronizer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutput {
    /// Send to every other participant.
    Broadcast(LockstepMessage),
    /// Store as the room's shared snapshot on the server.
    PublishState(Vec<u8>),
}

pub struct LockstepSynchronizer {
    config: LockstepConfig,
    role: Role,
    identity: String,
    /// Controller index used for local input (slot - 1)
    controller: u32,

    /// Absolute frame at the last reset
    origin: u64,
    current: u64,
    /// Buffered input by frame, relative to `origin`
    buffer: BTreeMap<u64, Vec<InputEvent>>,

    state: PaceState,
    resume_at: Option<Instant>,
    /// Follower has asked for a resync and not yet seen `ReadyReady`
    syncing: bool,
    /// Owner is collecting `Ready` replies
    collecting: bool,
    ready: HashSet<String>,
    /// Connected participants, self included
    participants: usize,
    last_stall_notice: Option<Instant>,

    outbox: Vec<SyncOutput>,
}

impl LockstepSynchronizer {
    pub fn new(role: Role, identity: impl Into<String>, controller: u32, config: LockstepConfig) -> Self {
        Self {
            config,
            role,
            identity: identity.into(),
            controller,
            origin: 0,
            current: 0,
            buffer: BTreeMap::new(),
            state: PaceState::Running,
            resume_at: None,
            syncing: false,
            collecting: false,
            ready: HashSet::new(),
            participants: 1,
            last_stall_notice: None,
            outbox: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_owner(&self) -> bool {
        self.role == Role::Owner
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> PaceState {
        self.state
    }

    /// Frames advanced since the last reset, as of the last call.
    pub fn current_frame(&self) -> u64 {
        self.current
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn buffered_frames(&self) -> impl Iterator<Item = u64> + '_ {
        self.buffer.keys().copied()
    }

    pub fn buffered(&self, frame: u64) -> Option<&[InputEvent]> {
        self.buffer.get(&frame).map(Vec::as_slice)
    }

    /// Update the number of connected participants, self included.
    pub fn set_participants(&mut self, count: usize) {
        self.participants = count.max(1);
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Take everything queued for sending.
    pub fn drain_outputs(&mut self) -> Vec<SyncOutput> {
        std::mem::take(&mut self.outbox)
    }

    fn broadcast(&mut self, message: LockstepMessage) {
        self.outbox.push(SyncOutput::Broadcast(message));
    }

    fn refresh_frame<S: Simulation>(&mut self, sim: &S) -> u64 {
        self.current = sim.frame().saturating_sub(self.origin);
        self.current
    }

    /// Clear all buffers and restart frame counting at the simulation's
    /// current frame.
    pub fn reset<S: Simulation>(&mut self, sim: &S) {
        self.origin = sim.frame();
        self.current = 0;
        self.buffer.clear();
        debug!("{} reset lockstep origin to {}", self.identity, self.origin);
    }

    /// Local controller input.
    ///
    /// Only controller 0 is accepted unless the caller is privileged. A
    /// privileged follower injects the event straight into its simulation
    /// without the round trip. Returns whether the event was accepted.
    pub fn local_input<S: Simulation>(&mut self, sim: &mut S, event: InputEvent, privileged: bool) -> bool {
        if event.player != 0 && !privileged {
            return false;
        }
        let current = self.refresh_frame(sim);

        match self.role {
            Role::Owner => {
                let event = InputEvent {
                    player: self.controller,
                    ..event
                };
                self.buffer.entry(current).or_default().push(event);
                sim.apply_input(&event);
            }
            Role::Follower if privileged => {
                sim.apply_input(&event);
            }
            Role::Follower => {
                let event = InputEvent {
                    player: self.controller,
                    ..event
                };
                self.broadcast(LockstepMessage::Input {
                    owner: false,
                    frame: current + self.config.look_ahead,
                    events: vec![event],
                });
            }
        }
        true
    }

    /// Per-tick hook, invoked once after every completed simulation frame.
    pub fn on_tick<S: Simulation>(&mut self, sim: &mut S, now: Instant) {
        let current = self.refresh_frame(sim);
        self.poll(sim, now);

        // Keep the stream flowing for the previous frame, pre-dated by L
        if let Some(previous) = current.checked_sub(1) {
            let events = match self.role {
                Role::Owner => self.buffer.get(&previous).cloned().unwrap_or_default(),
                Role::Follower => Vec::new(),
            };
            trace!("{} emits {} events for frame {}", self.identity, events.len(), previous);
            self.broadcast(LockstepMessage::Input {
                owner: self.is_owner(),
                frame: previous + self.config.look_ahead,
                events,
            });
        }

        if self.role == Role::Follower {
            if current < self.config.look_ahead || self.buffer.contains_key(&current) {
                if let Some(events) = self.buffer.get(&current) {
                    for event in events {
                        sim.apply_input(event);
                    }
                }
                if self.state == PaceState::WaitingForSync && !self.syncing {
                    self.state = PaceState::Running;
                    sim.play();
                }
            } else if !self.syncing {
                info!("{} has no input for frame {}, requesting resync", self.identity, current);
                sim.pause();
                self.syncing = true;
                self.state = PaceState::WaitingForSync;
                self.broadcast(LockstepMessage::Sync);
            }
        }

        if current > 0 && current % self.config.gc_interval.max(1) == 0 {
            let cutoff = current.saturating_sub(self.config.retention);
            self.buffer = self.buffer.split_off(&cutoff);
        }
    }

    /// Resume after an elapsed short pause and finish a resync whose
    /// outstanding participants have left.
    pub fn poll<S: Simulation>(&mut self, sim: &mut S, now: Instant) {
        if self.collecting && self.ready.len() >= self.participants {
            self.finish_resync(sim, now);
        }
        if let Some(at) = self.resume_at {
            if now >= at {
                self.resume_at = None;
                self.state = PaceState::Running;
                sim.play();
            }
        }
    }

    fn short_pause<S: Simulation>(&mut self, sim: &mut S, until: Instant) {
        sim.pause();
        self.state = PaceState::ShortPause;
        self.resume_at = Some(self.resume_at.map_or(until, |at| at.max(until)));
    }

    /// Handle a message from another participant.
    pub fn on_message<S: Simulation>(&mut self, sim: &mut S, from: &str, message: LockstepMessage, now: Instant) {
        if from == self.identity {
            return;
        }
        let current = self.refresh_frame(sim);

        match message {
            LockstepMessage::Input { owner, frame, events } => {
                self.on_input(sim, owner, frame, events, current, now);
            }
            LockstepMessage::ShortPause { by } => {
                if by != self.identity {
                    debug!("{} pausing for straggler {}", self.identity, by);
                    self.short_pause(sim, now + self.config.short_pause);
                }
            }
            LockstepMessage::Sync => {
                if self.is_owner() {
                    self.begin_resync(sim, now);
                }
            }
            LockstepMessage::State { state } => {
                if !self.is_owner() {
                    sim.pause();
                    sim.load_snapshot(&state);
                    self.reset(sim);
                    self.state = PaceState::WaitingForSync;
                    self.broadcast(LockstepMessage::Ready);
                }
            }
            LockstepMessage::Ready => {
                if self.is_owner() && self.collecting {
                    self.ready.insert(from.to_string());
                    if self.ready.len() >= self.participants {
                        self.finish_resync(sim, now);
                    }
                }
            }
            LockstepMessage::ReadyReady => {
                if !self.is_owner() {
                    info!("{} resynchronized", self.identity);
                    self.reset(sim);
                    self.syncing = false;
                    self.state = PaceState::Running;
                    self.resume_at = None;
                    sim.play();
                }
            }
            LockstepMessage::Restart => {
                if !self.is_owner() {
                    sim.restart();
                    self.reset(sim);
                    self.state = PaceState::Running;
                    sim.play();
                }
            }
            LockstepMessage::Pause => {
                if !self.is_owner() {
                    sim.pause();
                }
            }
            LockstepMessage::Play => {
                if !self.is_owner() {
                    sim.play();
                }
            }
        }
    }

    fn on_input<S: Simulation>(
        &mut self,
        sim: &mut S,
        from_owner: bool,
        frame: u64,
        events: Vec<InputEvent>,
        current: u64,
        now: Instant,
    ) {
        match self.role {
            Role::Owner => {
                if from_owner {
                    return;
                }
                for event in events {
                    self.buffer.entry(current).or_default().push(event);
                    sim.apply_input(&event);
                }
                // Compared against the tag itself, look-ahead included
                if current >= frame + self.config.stall_lag && self.state == PaceState::Running {
                    debug!("{} is {} frames ahead of a follower", self.identity, current - frame);
                    self.short_pause(sim, now + self.config.short_pause);
                }
            }
            Role::Follower => {
                if from_owner {
                    if frame <= current {
                        // Already reached: apply now, never re-buffer
                        for event in &events {
                            sim.apply_input(event);
                        }
                    } else {
                        self.buffer.entry(frame).or_default().extend(events);
                    }
                    if self.state == PaceState::WaitingForSync
                        && self.syncing
                        && self.buffer.contains_key(&current)
                    {
                        sim.play();
                    }
                }

                let stalled = current >= self.config.stall_min_age
                    && frame >= current + self.config.stall_lag;
                let recently = self
                    .last_stall_notice
                    .is_some_and(|at| now < at + self.config.short_pause);
                if stalled && !recently {
                    debug!("{} is behind at frame {}, sending stall notice", self.identity, current);
                    self.last_stall_notice = Some(now);
                    let by = self.identity.clone();
                    self.broadcast(LockstepMessage::ShortPause { by });
                }
            }
        }
    }

    fn begin_resync<S: Simulation>(&mut self, sim: &mut S, now: Instant) {
        if self.collecting {
            return;
        }
        info!("{} starting resync for {} participants", self.identity, self.participants);
        sim.pause();
        let state = sim.snapshot();
        self.collecting = true;
        self.ready.clear();
        self.ready.insert(self.identity.clone());
        self.state = PaceState::WaitingForSync;
        self.outbox.push(SyncOutput::PublishState(state.clone()));
        self.broadcast(LockstepMessage::State { state });
        if self.ready.len() >= self.participants {
            self.finish_resync(sim, now);
        }
    }

    fn finish_resync<S: Simulation>(&mut self, sim: &mut S, now: Instant) {
        self.collecting = false;
        self.ready.clear();
        self.broadcast(LockstepMessage::ReadyReady);
        self.reset(sim);
        self.state = PaceState::ShortPause;
        self.resume_at = Some(now + self.config.resync_resume_delay);
    }

    /// Owner-only: pause every participant.
    pub fn pause_session<S: Simulation>(&mut self, sim: &mut S) -> bool {
        if !self.is_owner() {
            return false;
        }
        sim.pause();
        self.broadcast(LockstepMessage::Pause);
        true
    }

    /// Owner-only: resume every participant.
    pub fn resume_session<S: Simulation>(&mut self, sim: &mut S) -> bool {
        if !self.is_owner() {
            return false;
        }
        sim.play();
        self.broadcast(LockstepMessage::Play);
        true
    }

    /// Owner-only: restart every participant's simulation from scratch.
    pub fn restart<S: Simulation>(&mut self, sim: &mut S) -> bool {
        if !self.is_owner() {
            return false;
        }
        sim.restart();
        self.reset(sim);
        self.state = PaceState::Running;
        sim.play();
        self.broadcast(LockstepMessage::Restart);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct MockSim {
        frame: u64,
        applied: Vec<InputEvent>,
        paused: bool,
        loaded: Vec<Vec<u8>>,
        restarts: u32,
    }

    impl MockSim {
        fn advance(&mut self) {
            self.frame += 1;
        }
    }

    impl Simulation for MockSim {
        fn frame(&self) -> u64 {
            self.frame
        }
        fn apply_input(&mut self, event: &InputEvent) {
            self.applied.push(*event);
        }
        fn snapshot(&self) -> Vec<u8> {
            self.frame.to_le_bytes().to_vec()
        }
        fn load_snapshot(&mut self, state: &[u8]) {
            self.loaded.push(state.to_vec());
        }
        fn pause(&mut self) {
            self.paused = true;
        }
        fn play(&mut self) {
            self.paused = false;
        }
        fn restart(&mut self) {
            self.restarts += 1;
            self.frame = 0;
        }
    }

    fn press(index: u32) -> InputEvent {
        InputEvent {
            player: 0,
            index,
            value: 1,
        }
    }

    fn owner() -> LockstepSynchronizer {
        LockstepSynchronizer::new(Role::Owner, "g1", 0, LockstepConfig::default())
    }

    fn follower() -> LockstepSynchronizer {
        LockstepSynchronizer::new(Role::Follower, "g2", 1, LockstepConfig::default())
    }

    fn inputs(outputs: &[SyncOutput]) -> Vec<(u64, Vec<InputEvent>)> {
        outputs
            .iter()
            .filter_map(|o| match o {
                SyncOutput::Broadcast(LockstepMessage::Input { frame, events, .. }) => {
                    Some((*frame, events.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_owner_applies_local_input_immediately() {
        let mut sim = MockSim::default();
        let mut sync = owner();
        assert!(sync.local_input(&mut sim, press(3), false));
        assert_eq!(sim.applied, vec![press(3)]);
        assert_eq!(sync.buffered(0), Some(&[press(3)][..]));

        sim.advance();
        sync.on_tick(&mut sim, Instant::now());
        assert_eq!(inputs(&sync.drain_outputs()), vec![(10, vec![press(3)])]);
    }

    #[test]
    fn test_owner_emits_placeholder_without_input() {
        let mut sim = MockSim::default();
        let mut sync = owner();
        sync.on_tick(&mut sim, Instant::now());
        assert!(sync.drain_outputs().is_empty());

        sim.advance();
        sync.on_tick(&mut sim, Instant::now());
        assert_eq!(inputs(&sync.drain_outputs()), vec![(10, vec![])]);
    }

    #[test]
    fn test_follower_sends_tagged_input() {
        let mut sim = MockSim::default();
        let mut sync = follower();
        sim.frame = 4;
        assert!(sync.local_input(&mut sim, press(2), false));
        assert!(sim.applied.is_empty());

        let expected = InputEvent { player: 1, ..press(2) };
        assert_eq!(inputs(&sync.drain_outputs()), vec![(14, vec![expected])]);
    }

    #[test]
    fn test_input_filtering() {
        let mut sim = MockSim::default();
        let mut sync = follower();
        let other = InputEvent {
            player: 3,
            index: 0,
            value: 1,
        };
        assert!(!sync.local_input(&mut sim, other, false));

        // Privileged injection skips the round trip
        assert!(sync.local_input(&mut sim, other, true));
        assert_eq!(sim.applied, vec![other]);
        assert!(sync.drain_outputs().is_empty());
    }

    #[test]
    fn test_follower_runs_freely_inside_look_ahead() {
        let mut sim = MockSim::default();
        let mut sync = follower();
        for _ in 0..9 {
            sim.advance();
            sync.on_tick(&mut sim, Instant::now());
        }
        assert_eq!(sync.state(), PaceState::Running);
        assert!(!sync.is_syncing());
        let outputs = sync.drain_outputs();
        assert!(!outputs.contains(&SyncOutput::Broadcast(LockstepMessage::Sync)));
        // Heartbeats only
        assert!(inputs(&outputs).iter().all(|(_, events)| events.is_empty()));
    }

    #[test]
    fn test_follower_requests_sync_once() {
        let mut sim = MockSim::default();
        let mut sync = follower();
        sim.frame = 10;
        sync.on_tick(&mut sim, Instant::now());
        assert!(sim.paused);
        assert_eq!(sync.state(), PaceState::WaitingForSync);

        sync.on_tick(&mut sim, Instant::now());
        let syncs = sync
            .drain_outputs()
            .into_iter()
            .filter(|o| *o == SyncOutput::Broadcast(LockstepMessage::Sync))
            .count();
        assert_eq!(syncs, 1);
    }

    #[test]
    fn test_follower_applies_owner_input_at_its_frame() {
        let mut sim = MockSim::default();
        let mut sync = follower();
        let now = Instant::now();
        let event = press(5);
        sync.on_message(
            &mut sim,
            "g1",
            LockstepMessage::Input {
                owner: true,
                frame: 10,
                events: vec![event],
            },
            now,
        );
        assert!(sim.applied.is_empty());

        sim.frame = 10;
        sync.on_tick(&mut sim, now);
        assert_eq!(sim.applied, vec![event]);
        assert_eq!(sync.state(), PaceState::Running);
    }

    #[test]
    fn test_late_owner_input_applied_once() {
        let mut sim = MockSim::default();
        let mut sync = follower();
        sim.frame = 20;
        let event = press(1);
        sync.on_message(
            &mut sim,
            "g1",
            LockstepMessage::Input {
                owner: true,
                frame: 20,
                events: vec![event],
            },
            Instant::now(),
        );
        assert_eq!(sim.applied, vec![event]);
        assert!(sync.buffered(20).is_none());
    }

    #[test]
    fn test_follower_ignores_other_followers_input() {
        let mut sim = MockSim::default();
        let mut sync = follower();
        sync.on_message(
            &mut sim,
            "g3",
            LockstepMessage::Input {
                owner: false,
                frame: 12,
                events: vec![press(1)],
            },
            Instant::now(),
        );
        assert!(sync.buffered(12).is_none());
    }

    #[test]
    fn test_owner_applies_follower_input() {
        let mut sim = MockSim::default();
        let mut sync = owner();
        sim.frame = 3;
        let event = InputEvent {
            player: 1,
            index: 4,
            value: 1,
        };
        sync.on_message(
            &mut sim,
            "g2",
            LockstepMessage::Input {
                owner: false,
                frame: 12,
                events: vec![event],
            },
            Instant::now(),
        );
        assert_eq!(sim.applied, vec![event]);
        assert_eq!(sync.buffered(3), Some(&[event][..]));
        assert_eq!(sync.state(), PaceState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_pauses_for_lagging_follower() {
        let mut sim = MockSim::default();
        let mut sync = owner();
        let now = Instant::now();
        let behind = |frame| LockstepMessage::Input {
            owner: false,
            frame,
            events: vec![],
        };
        sim.frame = 30;

        // Tags within stall_lag of the owner's frame are ordinary jitter
        sync.on_message(&mut sim, "g2", behind(25), now);
        sync.on_message(&mut sim, "g2", behind(21), now);
        assert!(!sim.paused);
        assert_eq!(sync.state(), PaceState::Running);

        sync.on_message(&mut sim, "g2", behind(20), now);
        assert!(sim.paused);
        assert_eq!(sync.state(), PaceState::ShortPause);

        sync.poll(&mut sim, now + Duration::from_millis(47));
        assert!(sim.paused);
        sync.poll(&mut sim, now + Duration::from_millis(48));
        assert!(!sim.paused);
        assert_eq!(sync.state(), PaceState::Running);
    }

    #[test]
    fn test_owner_ignores_follower_in_step() {
        let mut sim = MockSim::default();
        let mut sync = owner();
        sim.frame = 15;
        // A follower on the same frame tags its input current - 1 + L
        sync.on_message(
            &mut sim,
            "g2",
            LockstepMessage::Input {
                owner: false,
                frame: 24,
                events: vec![],
            },
            Instant::now(),
        );
        sync.on_message(
            &mut sim,
            "g2",
            LockstepMessage::Input {
                owner: false,
                frame: 10,
                events: vec![],
            },
            Instant::now(),
        );
        assert!(!sim.paused);
        assert_eq!(sync.state(), PaceState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_pause_from_peer() {
        let mut sim = MockSim::default();
        let mut sync = follower();
        let now = Instant::now();

        sync.on_message(&mut sim, "g1", LockstepMessage::ShortPause { by: "g2".into() }, now);
        assert!(!sim.paused);

        sync.on_message(&mut sim, "g3", LockstepMessage::ShortPause { by: "g3".into() }, now);
        assert!(sim.paused);
        sync.poll(&mut sim, now + Duration::from_millis(48));
        assert!(!sim.paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_stall_notice() {
        let mut sim = MockSim::default();
        let mut sync = follower();
        let now = Instant::now();
        let ahead = |frame| LockstepMessage::Input {
            owner: true,
            frame,
            events: vec![],
        };
        let notice = vec![SyncOutput::Broadcast(LockstepMessage::ShortPause { by: "g2".into() })];

        // Too early in the session
        sim.frame = 99;
        sync.on_message(&mut sim, "g1", ahead(150), now);
        assert!(sync.drain_outputs().is_empty());

        sim.frame = 120;
        sync.on_message(&mut sim, "g1", ahead(129), now);
        assert!(sync.drain_outputs().is_empty());

        sync.on_message(&mut sim, "g1", ahead(130), now);
        assert_eq!(sync.drain_outputs(), notice);

        // At most one notice per short pause window
        sync.on_message(&mut sim, "g1", ahead(135), now + Duration::from_millis(47));
        assert!(sync.drain_outputs().is_empty());
        sync.on_message(&mut sim, "g1", ahead(136), now + Duration::from_millis(48));
        assert_eq!(sync.drain_outputs(), notice);
    }

    #[test]
    fn test_stall_notice_starts_at_min_age() {
        let mut sim = MockSim::default();
        let mut sync = follower();
        sim.frame = 100;
        sync.on_message(
            &mut sim,
            "g1",
            LockstepMessage::Input {
                owner: true,
                frame: 110,
                events: vec![],
            },
            Instant::now(),
        );
        assert_eq!(
            sync.drain_outputs(),
            vec![SyncOutput::Broadcast(LockstepMessage::ShortPause { by: "g2".into() })]
        );
    }

    #[test]
    fn test_resync_handshake() {
        let now = Instant::now();
        let mut owner_sim = MockSim {
            frame: 200,
            ..Default::default()
        };
        let mut follower_sim = MockSim {
            frame: 150,
            ..Default::default()
        };
        let mut lead = owner();
        let mut follow = follower();
        lead.set_participants(2);
        follow.set_participants(2);

        follow.on_tick(&mut follower_sim, now);
        assert!(follow.is_syncing());
        let out = follow.drain_outputs();
        assert!(out.contains(&SyncOutput::Broadcast(LockstepMessage::Sync)));

        lead.on_message(&mut owner_sim, "g2", LockstepMessage::Sync, now);
        assert!(owner_sim.paused);
        let out = lead.drain_outputs();
        let snapshot = owner_sim.snapshot();
        assert_eq!(
            out,
            vec![
                SyncOutput::PublishState(snapshot.clone()),
                SyncOutput::Broadcast(LockstepMessage::State {
                    state: snapshot.clone()
                }),
            ]
        );

        follow.on_message(
            &mut follower_sim,
            "g1",
            LockstepMessage::State {
                state: snapshot.clone(),
            },
            now,
        );
        assert_eq!(follower_sim.loaded, vec![snapshot]);
        assert_eq!(
            follow.drain_outputs(),
            vec![SyncOutput::Broadcast(LockstepMessage::Ready)]
        );

        lead.on_message(&mut owner_sim, "g2", LockstepMessage::Ready, now);
        assert_eq!(
            lead.drain_outputs(),
            vec![SyncOutput::Broadcast(LockstepMessage::ReadyReady)]
        );
        assert_eq!(lead.origin(), 200);
        assert!(owner_sim.paused);
        lead.poll(&mut owner_sim, now + Duration::from_millis(48));
        assert!(!owner_sim.paused);

        follow.on_message(&mut follower_sim, "g1", LockstepMessage::ReadyReady, now);
        assert!(!follow.is_syncing());
        assert!(!follower_sim.paused);
        assert_eq!(follow.origin(), 150);
        assert_eq!(follow.current_frame(), 0);
    }

    #[test]
    fn test_resync_alone_finishes_immediately() {
        let mut sim = MockSim::default();
        let mut sync = owner();
        sync.on_message(&mut sim, "g2", LockstepMessage::Sync, Instant::now());
        let out = sync.drain_outputs();
        assert!(out.contains(&SyncOutput::Broadcast(LockstepMessage::ReadyReady)));
    }

    #[test]
    fn test_resync_completes_when_participant_leaves() {
        let now = Instant::now();
        let mut sim = MockSim::default();
        let mut sync = owner();
        sync.set_participants(3);
        sync.on_message(&mut sim, "g2", LockstepMessage::Sync, now);
        sync.on_message(&mut sim, "g2", LockstepMessage::Ready, now);
        // Duplicate ready does not count twice
        sync.on_message(&mut sim, "g2", LockstepMessage::Ready, now);
        sync.drain_outputs();

        sync.set_participants(2);
        sync.poll(&mut sim, now);
        assert_eq!(
            sync.drain_outputs(),
            vec![SyncOutput::Broadcast(LockstepMessage::ReadyReady)]
        );
    }

    #[test]
    fn test_buffer_garbage_collection() {
        let mut sim = MockSim::default();
        let mut sync = follower();
        for frame in 10..=100 {
            sync.on_message(
                &mut sim,
                "g1",
                LockstepMessage::Input {
                    owner: true,
                    frame,
                    events: vec![],
                },
                Instant::now(),
            );
        }
        sim.frame = 100;
        sync.on_tick(&mut sim, Instant::now());
        assert_eq!(sync.buffered_frames().next(), Some(50));
        assert_eq!(sync.buffered_frames().last(), Some(100));
    }

    #[test]
    fn test_zero_gc_interval_collects_every_frame() {
        let mut sim = MockSim::default();
        let config = LockstepConfig {
            gc_interval: 0,
            ..LockstepConfig::default()
        };
        let mut sync = LockstepSynchronizer::new(Role::Owner, "g1", 0, config);
        for frame in 1..=60 {
            sim.frame = frame;
            sync.local_input(&mut sim, press(1), false);
            sync.on_tick(&mut sim, Instant::now());
        }
        assert_eq!(sync.buffered_frames().next(), Some(10));
    }

    #[test]
    fn test_session_control() {
        let now = Instant::now();
        let mut owner_sim = MockSim::default();
        let mut follower_sim = MockSim::default();
        let mut lead = owner();
        let mut follow = follower();

        assert!(!follow.pause_session(&mut follower_sim));
        assert!(lead.pause_session(&mut owner_sim));
        assert!(owner_sim.paused);
        follow.on_message(&mut follower_sim, "g1", LockstepMessage::Pause, now);
        assert!(follower_sim.paused);

        assert!(lead.resume_session(&mut owner_sim));
        follow.on_message(&mut follower_sim, "g1", LockstepMessage::Play, now);
        assert!(!follower_sim.paused);

        owner_sim.frame = 40;
        follower_sim.frame = 40;
        assert!(lead.restart(&mut owner_sim));
        assert_eq!(owner_sim.restarts, 1);
        follow.on_message(&mut follower_sim, "g1", LockstepMessage::Restart, now);
        assert_eq!(follower_sim.restarts, 1);
        assert_eq!(follow.origin(), 0);

        let out = lead.drain_outputs();
        assert_eq!(
            out,
            vec![
                SyncOutput::Broadcast(LockstepMessage::Pause),
                SyncOutput::Broadcast(LockstepMessage::Play),
                SyncOutput::Broadcast(LockstepMessage::Restart),
            ]
        );
    }

    #[test]
    fn test_own_messages_ignored() {
        let mut sim = MockSim::default();
        let mut sync = owner();
        sync.on_message(&mut sim, "g1", LockstepMessage::Sync, Instant::now());
        assert!(sync.drain_outputs().is_empty());
    }
}
