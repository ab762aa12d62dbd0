use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use netplay_core::admin;
use netplay_core::config::{with_port, ServerConfig};
use netplay_core::server::NetplayServer;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Netplay room server.
///
/// Serves the WebSocket session endpoint and the admin HTTP API side by
/// side. Flags override `PORT`, `ADMIN_PORT`, `API_KEY` and `ADMIN_KEY`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket port
    #[arg(long)]
    port: Option<u16>,

    /// Admin HTTP port
    #[arg(long)]
    admin_port: Option<u16>,

    /// Interface to bind both listeners on
    #[arg(long)]
    host: Option<String>,

    /// Secret for signing bearer tokens
    #[arg(long)]
    api_key: Option<String>,

    /// Credential for administrative calls
    #[arg(long)]
    admin_key: Option<String>,

    /// Seconds a disconnected player keeps its slot
    #[arg(long)]
    grace_secs: Option<u64>,

    /// Seconds between latency pings
    #[arg(long)]
    ping_secs: Option<u64>,

    /// Refuse player joins
    #[arg(long)]
    no_players: bool,

    /// Refuse viewer joins
    #[arg(long)]
    no_viewers: bool,
}

impl Args {
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(host) = &self.host {
            config.bind_addr = rehost(&config.bind_addr, host);
            config.admin_addr = rehost(&config.admin_addr, host);
        }
        if let Some(port) = self.port {
            config.bind_addr = with_port(&config.bind_addr, port);
        }
        if let Some(port) = self.admin_port {
            config.admin_addr = with_port(&config.admin_addr, port);
        }
        if self.api_key.is_some() {
            config.api_key = self.api_key;
        }
        if self.admin_key.is_some() {
            config.admin_key = self.admin_key;
        }
        if let Some(secs) = self.grace_secs {
            config.registry.reconnect_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = self.ping_secs {
            config.ping_interval = Duration::from_secs(secs.max(1));
        }
        config.registry.players_enabled &= !self.no_players;
        config.registry.viewers_enabled &= !self.no_viewers;
        config
    }
}

fn rehost(addr: &str, host: &str) -> String {
    let port = addr.rsplit_once(':').map_or("0", |(_, port)| port);
    format!("{host}:{port}")
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().apply(ServerConfig::from_env());
    if config.api_key.is_none() {
        warn!("No API key configured: every connection will be refused");
    }
    if config.admin_key.is_none() {
        warn!("No admin key configured: administrative calls are disabled");
    }

    info!("Starting netplay server...");
    let admin_addr = config.admin_addr.clone();
    let server = NetplayServer::new(config);

    let ws_listener = TcpListener::bind(server.bind_addr()).await?;
    let admin_listener = TcpListener::bind(&admin_addr).await?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let admin_task = tokio::spawn(admin::serve(admin_listener, server.admin_state(), async {
        let _ = stop_rx.await;
    }));

    tokio::select! {
        result = server.serve(ws_listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    let _ = stop_tx.send(());
    admin_task.await??;
    Ok(())
}
