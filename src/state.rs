//! Shared relay state.
//!
//! Two overlapping indexes over live connections: `clients` (browser peers on
//! `/signal`, by client id) and `servers` (sibling relays on `/relay`, by
//! node id), plus the `relays` adjacency table mapping each subscribed
//! info-hash digest to the node ids participating in that mesh. Guards from
//! one map are never held across a call that touches another map.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};

use crate::identity::{sha1_hex, NodeIdentity};
use crate::protocol::Frame;

/// Relay configuration, assembled from the CLI.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct RelayConfig {
    /// Public host; half of the node's `address`.
    pub host: String,
    pub port: u16,
    /// Interface the listener binds to.
    pub server: String,
    /// Public hostname used in `web` instead of `host`, when set.
    pub domain: Option<String>,
    /// Info-hashes to subscribe; opaque strings, digested with SHA-1.
    pub hashes: Vec<String>,
    /// Per-digest cap on relay peers (0 = unlimited).
    pub server_connections: usize,
    /// Soft cap on clients; overflow triggers a graceful HTTP close (0 = unlimited).
    pub client_connections: usize,
    /// Whether to run the DHT listener.
    pub relay: bool,
    /// Verbose logging.
    pub dev: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10509,
            server: "0.0.0.0".to_string(),
            domain: None,
            hashes: Vec::new(),
            server_connections: 0,
            client_connections: 0,
            relay: false,
            dev: false,
        }
    }
}

/// Outbound instruction for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Frame),
    Close,
}

pub type ConnSender = mpsc::UnboundedSender<Outbound>;

/// A browser torrent client connected on `/signal`.
#[derive(Debug)]
pub struct ClientConn {
    pub id: String,
    pub hash: String,
    /// Desired number of peerings, clamped to 1..=6.
    pub want: usize,
    pub active: bool,
    /// Peer client ids with an offer/answer exchange in flight.
    pub ids: HashSet<String>,
    /// Peer client ids with a completed peering.
    pub web: HashSet<String>,
    /// Millisecond timestamp of the last relay-driven signal, None when idle.
    pub stamp: Option<i64>,
    pub sender: ConnSender,
}

impl ClientConn {
    pub fn new(id: &str, hash: &str, want: usize, sender: ConnSender) -> Self {
        Self {
            id: id.to_string(),
            hash: hash.to_string(),
            want,
            active: true,
            ids: HashSet::new(),
            web: HashSet::new(),
            stamp: None,
            sender,
        }
    }
}

/// A sibling relay connected on `/relay`, dialed or accepted.
#[derive(Debug)]
#[allow(dead_code)]
pub struct RelayConn {
    /// Peer node id (SHA-1 hex of its `host:port`).
    pub id: String,
    /// True when the peer dialed us, false when we dialed it.
    pub server: bool,
    /// Socket open; dialed entries exist in `servers` before the connect resolves.
    pub open: bool,
    /// Cleared by the health ticker, set back by `pong`.
    pub active: bool,
    /// Handshake completed and the peer's HTTP listener is up.
    pub session: bool,
    /// The digest this connection was dialed/accepted for; `session` must echo it.
    pub relay: String,
    /// All digests this peer shares with us.
    pub relays: Vec<String>,
    // Peer identity, recorded from its `session` frame.
    pub address: String,
    pub web: String,
    pub host: String,
    pub port: u16,
    pub domain: Option<String>,
    pub sender: ConnSender,
}

impl RelayConn {
    pub fn new(id: &str, digest: &str, server: bool, open: bool, sender: ConnSender) -> Self {
        Self {
            id: id.to_string(),
            server,
            open,
            active: true,
            session: false,
            relay: digest.to_string(),
            relays: Vec::new(),
            address: String::new(),
            web: String::new(),
            host: String::new(),
            port: 0,
            domain: None,
            sender,
        }
    }
}

/// Reconnection backoff for one peer node id.
#[derive(Debug, Clone, Copy)]
pub struct BackoffEntry {
    /// Millisecond timestamp of the last attempt.
    pub stamp: i64,
    /// Seconds to wait before the next attempt; doubles per failure.
    pub wait: i64,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Shared server state. Cheap to clone; all maps are concurrent.
#[derive(Clone)]
pub struct RelayState {
    pub identity: Arc<NodeIdentity>,
    pub config: Arc<RelayConfig>,

    /// info-hash → digest, fixed at boot.
    pub digests: Arc<HashMap<String, String>>,
    /// digest → info-hash, fixed at boot.
    pub hashes: Arc<HashMap<String, String>>,

    /// Client id → connection.
    pub clients: Arc<DashMap<String, ClientConn>>,
    /// Peer node id → relay connection.
    pub servers: Arc<DashMap<String, RelayConn>>,
    /// Digest → node ids of relay peers in that mesh.
    pub relays: Arc<DashMap<String, Vec<String>>>,
    /// Info-hash → client ids awaiting a partner.
    pub offers: Arc<DashMap<String, HashSet<String>>>,
    /// Peer node id → reconnection backoff.
    pub backoff: Arc<DashMap<String, BackoffEntry>>,

    /// Set true to drain the HTTP listener (graceful close / restart).
    pub close_http: Arc<watch::Sender<bool>>,
    /// Set by `stop()`; the serve loop exits instead of scheduling a restart.
    pub stopping: Arc<AtomicBool>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let identity = NodeIdentity::new(&config.host, config.port, config.domain.clone());

        let mut digests = HashMap::new();
        let mut hashes = HashMap::new();
        let relays = DashMap::new();
        let offers = DashMap::new();
        for hash in &config.hashes {
            let digest = sha1_hex(hash);
            relays.insert(digest.clone(), Vec::new());
            offers.insert(hash.clone(), HashSet::new());
            hashes.insert(digest.clone(), hash.clone());
            digests.insert(hash.clone(), digest);
        }

        let (close_tx, _) = watch::channel(false);

        Self {
            identity: Arc::new(identity),
            config: Arc::new(config),
            digests: Arc::new(digests),
            hashes: Arc::new(hashes),
            clients: Arc::new(DashMap::new()),
            servers: Arc::new(DashMap::new()),
            relays: Arc::new(relays),
            offers: Arc::new(offers),
            backoff: Arc::new(DashMap::new()),
            close_http: Arc::new(close_tx),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribed_hash(&self, hash: &str) -> bool {
        self.digests.contains_key(hash)
    }

    pub fn subscribed_digest(&self, digest: &str) -> bool {
        self.hashes.contains_key(digest)
    }

    // ── Clients ───────────────────────────────────────────────────────────

    /// Register a client. Fails when the id collides with a live client;
    /// the caller must reject the new socket.
    pub fn add_client(&self, conn: ClientConn) -> bool {
        match self.clients.entry(conn.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!(id = conn.id.as_str(), hash = conn.hash.as_str(), "client joined");
                slot.insert(conn);
                true
            }
        }
    }

    pub fn remove_client(&self, id: &str) {
        if self.clients.remove(id).is_some() {
            tracing::info!(id = id, "client left");
        }
    }

    /// Send a frame to a live client. Returns false when the client is gone.
    pub fn send_to_client(&self, id: &str, frame: Frame) -> bool {
        let sender = match self.clients.get(id) {
            Some(conn) => conn.sender.clone(),
            None => return false,
        };
        sender.send(Outbound::Frame(frame)).is_ok()
    }

    /// Ask a client's writer task to close the socket.
    pub fn close_client(&self, id: &str) {
        if let Some(conn) = self.clients.get(id) {
            let _ = conn.sender.send(Outbound::Close);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    // ── Relay peers ───────────────────────────────────────────────────────

    /// Register a relay peer. Fails on a live node-id collision.
    pub fn add_server(&self, conn: RelayConn) -> bool {
        match self.servers.entry(conn.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!(
                    peer = conn.id.as_str(),
                    dialed = !conn.server,
                    "relay peer registered"
                );
                slot.insert(conn);
                true
            }
        }
    }

    /// Drop a relay peer from `servers` and every membership list.
    pub fn remove_server(&self, id: &str) {
        let digests: Vec<String> = match self.servers.remove(id) {
            Some((_, conn)) => conn.relays,
            None => return,
        };
        for digest in &digests {
            self.detach_relay(digest, id);
        }
        tracing::info!(peer = id, "relay peer removed");
    }

    pub fn send_to_server(&self, id: &str, frame: Frame) -> bool {
        let sender = match self.servers.get(id) {
            Some(conn) => conn.sender.clone(),
            None => return false,
        };
        sender.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn close_server(&self, id: &str) {
        if let Some(conn) = self.servers.get(id) {
            let _ = conn.sender.send(Outbound::Close);
        }
    }

    /// Join a peer into a digest's membership list; idempotent by node id.
    pub fn attach_relay(&self, digest: &str, peer_id: &str) {
        let mut members = self.relays.entry(digest.to_string()).or_default();
        if !members.iter().any(|id| id == peer_id) {
            members.push(peer_id.to_string());
        }
    }

    pub fn detach_relay(&self, digest: &str, peer_id: &str) {
        if let Some(mut members) = self.relays.get_mut(digest) {
            members.retain(|id| id != peer_id);
        }
    }

    /// Node ids currently in a digest's mesh.
    pub fn relays_for(&self, digest: &str) -> Vec<String> {
        self.relays
            .get(digest)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    pub fn relay_count(&self, digest: &str) -> usize {
        self.relays.get(digest).map(|members| members.len()).unwrap_or(0)
    }

    /// Public `web` address of a random handshaken peer in this hash's mesh.
    pub fn random_relay(&self, hash: &str) -> Option<String> {
        let digest = self.digests.get(hash)?;
        let members = self.relays_for(digest);
        let candidates: Vec<String> = members
            .iter()
            .filter_map(|id| {
                let conn = self.servers.get(id)?;
                if conn.session && !conn.web.is_empty() {
                    Some(conn.web.clone())
                } else {
                    None
                }
            })
            .collect();
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    // ── Offer queues ──────────────────────────────────────────────────────

    /// Add a client to its hash's waiting set; idempotent.
    pub fn enqueue_offer(&self, hash: &str, client_id: &str) {
        self.offers
            .entry(hash.to_string())
            .or_default()
            .insert(client_id.to_string());
    }

    pub fn dequeue_offer(&self, hash: &str, client_id: &str) {
        if let Some(mut waiting) = self.offers.get_mut(hash) {
            waiting.remove(client_id);
        }
    }

    pub fn waiting_for(&self, hash: &str) -> HashSet<String> {
        self.offers
            .get(hash)
            .map(|waiting| waiting.clone())
            .unwrap_or_default()
    }

    // ── Backoff ───────────────────────────────────────────────────────────

    /// True when no entry exists or the wait has elapsed.
    pub fn should_try(&self, peer_id: &str) -> bool {
        match self.backoff.get(peer_id) {
            Some(entry) => (now_ms() - entry.stamp) / 1000 >= entry.wait,
            None => true,
        }
    }

    /// Record a failed attempt: first failure waits 1s, doubling thereafter.
    pub fn record_failure(&self, peer_id: &str) {
        let mut entry = self.backoff.entry(peer_id.to_string()).or_insert(BackoffEntry {
            stamp: now_ms(),
            wait: 0,
        });
        if entry.wait == 0 {
            entry.wait = 1;
        } else {
            entry.stamp = now_ms();
            entry.wait *= 2;
        }
    }

    pub fn clear_backoff(&self, peer_id: &str) {
        self.backoff.remove(peer_id);
    }

    /// Dropped whole on HTTP close to force quick rediscovery after restart.
    pub fn clear_all_backoff(&self) {
        self.backoff.clear();
    }

    // ── Lifecycle signals ─────────────────────────────────────────────────

    pub fn request_http_close(&self) {
        self.close_http.send_replace(true);
    }

    pub fn http_close_requested(&self) -> watch::Receiver<bool> {
        self.close_http.subscribe()
    }

    pub fn reset_http_close(&self) {
        self.close_http.send_replace(false);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn set_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}

/// Test fixture: a state subscribed to the given hashes, bound to 10.0.0.1.
#[cfg(test)]
pub(crate) fn test_state(hashes: &[&str]) -> RelayState {
    RelayState::new(RelayConfig {
        host: "10.0.0.1".to_string(),
        hashes: hashes.iter().map(|h| h.to_string()).collect(),
        ..RelayConfig::default()
    })
}
