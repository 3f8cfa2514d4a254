//! DHT peer discovery.
//!
//! Thin adapter over the mainline DHT: every subscribed digest is announced
//! and looked up on an interval, and each sighted peer is pushed onto a
//! channel as a [`PeerEvent`]. Nothing else in the crate touches the DHT
//! library — the dialer consumes the event stream and tests feed it directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustydht_lib::common::Id;
use rustydht_lib::dht::{operations, DHTBuilder, DHTSettings, DHT};
use rustydht_lib::shutdown::{create_shutdown, ShutdownSender};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A sighting of a relay peer for one subscribed digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub host: String,
    pub port: u16,
    pub digest: String,
}

impl PeerEvent {
    pub fn from_addr(addr: SocketAddr, digest: &str) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            digest: digest.to_string(),
        }
    }
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// How often each digest is re-announced and re-looked-up.
const SWEEP_INTERVAL_SECS: u64 = 300;
/// Upper bound on a single get_peers / announce walk.
const OPERATION_TIMEOUT_SECS: u64 = 30;

/// Handle on the running DHT node and its per-digest worker tasks.
pub struct DhtSource {
    shutdown: ShutdownSender,
    tasks: Vec<JoinHandle<()>>,
}

impl DhtSource {
    /// Start the DHT on `bind`, announcing `announce_port` for every digest,
    /// and return the peer-event stream.
    pub fn start(
        bind: SocketAddr,
        announce_port: u16,
        digests: Vec<String>,
    ) -> Result<(Self, PeerEvents), Box<dyn std::error::Error + Send + Sync>> {
        let (shutdown_tx, shutdown_rx) = create_shutdown();

        let dht = Arc::new(
            DHTBuilder::new()
                .listen_addr(bind)
                .settings(DHTSettings::default())
                .build(shutdown_rx)?,
        );

        let mut tasks = Vec::new();

        let node = dht.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = node.run_event_loop().await {
                tracing::error!(error = %e, "dht event loop exited");
            }
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        for digest in digests {
            let node = dht.clone();
            let events = tx.clone();
            tasks.push(tokio::spawn(async move {
                sweep_digest(node, digest, announce_port, events).await;
            }));
        }

        tracing::info!(addr = %bind, "dht listening");
        Ok((
            Self {
                shutdown: shutdown_tx,
                tasks,
            },
            rx,
        ))
    }

    /// Stop the worker tasks and shut the DHT node down.
    pub async fn destroy(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shutdown.shutdown().await;
        tracing::info!("dht destroyed");
    }
}

/// Announce-and-lookup loop for one digest.
async fn sweep_digest(
    dht: Arc<DHT>,
    digest: String,
    announce_port: u16,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let info_hash = match Id::from_hex(&digest) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(digest = digest.as_str(), error = %e, "bad digest");
            return;
        }
    };
    let timeout = Duration::from_secs(OPERATION_TIMEOUT_SECS);
    let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));

    loop {
        interval.tick().await;

        match operations::get_peers(&dht, info_hash, timeout).await {
            Ok(found) => {
                tracing::debug!(
                    digest = digest.as_str(),
                    peers = found.peers().len(),
                    "dht lookup finished"
                );
                for addr in found.peers() {
                    if events.send(PeerEvent::from_addr(*addr, &digest)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(digest = digest.as_str(), error = %e, "dht lookup failed");
            }
        }

        if let Err(e) =
            operations::announce_peer(&dht, info_hash, Some(announce_port), timeout).await
        {
            tracing::warn!(digest = digest.as_str(), error = %e, "dht announce failed");
        }
    }
}
