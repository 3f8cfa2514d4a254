//! BitTorrent signaling relay.
//!
//! Browser torrent clients cannot talk to UDP trackers, so they open a
//! WebSocket to a relay, advertise an info-hash, and let the relay broker
//! WebRTC offer/answer exchanges with other clients in the same swarm.
//! Relays subscribed to the same info-hashes find each other over the
//! mainline DHT and keep a WebSocket mesh among themselves, used for
//! liveness tracking and for handing clients off when a relay goes down.
//!
//! The relay never reads the WebRTC payloads it forwards and keeps no state
//! across restarts.

mod dht;
mod identity;
mod mesh;
mod protocol;
mod server;
mod signal;
mod state;

use clap::Parser;

use server::RelayServer;
use state::RelayConfig;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "bittorrent-relay", version, about = "WebRTC signaling relay for BitTorrent swarms")]
struct Args {
    /// Public host of this node; half of its address identity
    #[arg(long, env = "RELAY_HOST")]
    host: String,

    /// Port for the HTTP+WebSocket listener (and the DHT, when enabled)
    #[arg(short, long, default_value_t = 10509, env = "RELAY_PORT")]
    port: u16,

    /// Interface the listener binds to
    #[arg(long, default_value = "0.0.0.0", env = "RELAY_SERVER")]
    server: String,

    /// Public hostname handed to clients instead of the host
    #[arg(long, env = "RELAY_DOMAIN")]
    domain: Option<String>,

    /// Info-hashes to relay (comma-separated)
    #[arg(long, required = true, value_delimiter = ',', env = "RELAY_HASHES")]
    hashes: Vec<String>,

    /// Cap on relay peers per info-hash (0 = unlimited)
    #[arg(long, default_value_t = 0, env = "RELAY_SERVER_CONNECTIONS")]
    server_connections: usize,

    /// Soft cap on clients; overflow drains the listener (0 = unlimited)
    #[arg(long, default_value_t = 0, env = "RELAY_CLIENT_CONNECTIONS")]
    client_connections: usize,

    /// Also run the DHT listener and announce every subscribed digest
    #[arg(long, env = "RELAY_RELAY")]
    relay: bool,

    /// Verbose logging
    #[arg(long, env = "RELAY_DEV")]
    dev: bool,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_filter = if args.dev {
        "bittorrent_relay=debug,tower_http=debug"
    } else {
        "bittorrent_relay=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let hashes: Vec<String> = args
        .hashes
        .into_iter()
        .map(|hash| hash.trim().to_string())
        .filter(|hash| !hash.is_empty())
        .collect();
    if hashes.is_empty() {
        tracing::error!("at least one info-hash is required");
        std::process::exit(1);
    }

    let config = RelayConfig {
        host: args.host,
        port: args.port,
        server: args.server,
        domain: args.domain,
        hashes,
        server_connections: args.server_connections,
        client_connections: args.client_connections,
        relay: args.relay,
        dev: args.dev,
    };

    let mut relay = RelayServer::new(config);
    if let Err(e) = relay.start() {
        tracing::error!(error = %e, "failed to start relay");
        std::process::exit(1);
    }

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("shutdown signal received");
    relay.stop().await;
}
