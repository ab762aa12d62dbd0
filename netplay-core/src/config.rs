//! Configuration for the registry, the session server and the lockstep
//! synchronizer.
//!
//! All structs carry a `Default` with the production values. The server
//! config can additionally be overlaid from environment variables
//! (`PORT`, `ADMIN_PORT`, `API_KEY`, `ADMIN_KEY`); the binary then applies
//! command-line overrides on top.

use std::time::Duration;

/// Room registry policy knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Globally allow player admission
    pub players_enabled: bool,
    /// Globally allow viewer admission
    pub viewers_enabled: bool,
    /// How long a disconnected player keeps its slot
    pub reconnect_grace: Duration,
    /// Messages buffered per room subscriber before it lags
    pub broadcast_capacity: usize,
    /// Upper bound for a stored shared-state snapshot
    pub max_snapshot_bytes: usize,
    /// Upper bound for one relayed negotiation payload
    pub max_signal_bytes: usize,
    /// `max_players` when room options leave it unset
    pub default_max_players: u32,
    /// `max_viewers` when room options leave it unset
    pub default_max_viewers: u32,
    /// Frames a room buffers while waiting on a slow player
    pub max_pending_frames: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            players_enabled: true,
            viewers_enabled: true,
            reconnect_grace: Duration::from_secs(30),
            broadcast_capacity: 256,
            max_snapshot_bytes: 16 * 1024 * 1024, // 16MB
            max_signal_bytes: 64 * 1024,          // 64KB
            default_max_players: 2,
            default_max_viewers: 0,
            max_pending_frames: 600,
        }
    }
}

/// Session server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket listen address
    pub bind_addr: String,
    /// Admin HTTP listen address
    pub admin_addr: String,
    /// Secret used to sign and verify bearer tokens (None = reject all)
    pub api_key: Option<String>,
    /// Credential required by non-listing admin calls (None = reject all)
    pub admin_key: Option<String>,
    /// Lifetime of issued bearer tokens
    pub token_ttl: Duration,
    /// Latency ping cadence per connection
    pub ping_interval: Duration,
    /// Registry policy
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            admin_addr: "127.0.0.1:8081".to_string(),
            api_key: None,
            admin_key: None,
            token_ttl: Duration::from_secs(24 * 60 * 60),
            ping_interval: Duration::from_secs(5),
            registry: RegistryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `PORT`, `ADMIN_PORT`, `API_KEY`, `ADMIN_KEY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable lookup, so the
    /// parsing can be tested without touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT").and_then(|p| p.parse::<u16>().ok()) {
            config.bind_addr = with_port(&config.bind_addr, port);
        }
        if let Some(port) = lookup("ADMIN_PORT").and_then(|p| p.parse::<u16>().ok()) {
            config.admin_addr = with_port(&config.admin_addr, port);
        }
        config.api_key = lookup("API_KEY").filter(|k| !k.is_empty());
        config.admin_key = lookup("ADMIN_KEY").filter(|k| !k.is_empty());
        config
    }
}

/// Replace the port of a `host:port` string.
pub fn with_port(addr: &str, port: u16) -> String {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    format!("{host}:{port}")
}

/// Lockstep pacing constants. Frame values are in simulation frames.
#[derive(Debug, Clone)]
pub struct LockstepConfig {
    /// Frames by which emitted input is pre-dated (L)
    pub look_ahead: u64,
    /// Lag (in frames) behind which a straggler triggers a pause
    pub stall_lag: u64,
    /// Frames since reset before followers may raise stall notices
    pub stall_min_age: u64,
    /// Buffer garbage collection cadence
    pub gc_interval: u64,
    /// Frames of history kept behind the current frame
    pub retention: u64,
    /// Length of a stall-recovery pause
    pub short_pause: Duration,
    /// Delay before the owner resumes after `readyready`
    pub resync_resume_delay: Duration,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            look_ahead: 10,
            stall_lag: 10,
            stall_min_age: 100,
            gc_interval: 100,
            retention: 50,
            short_pause: Duration::from_millis(48),
            resync_resume_delay: Duration::from_millis(48),
        }
    }
}
