//! Server lifecycle.
//!
//! One `RelayServer` owns the HTTP+WebSocket listener, the health ticker and
//! the DHT subscription. The listener can go down without taking the process
//! with it: a graceful close hands every client off to a sibling relay,
//! marks this node `off` across the mesh, and a scheduled restart reopens
//! the listener later. Mesh sockets survive the restart.

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::dht::{DhtSource, PeerEvents};
use crate::mesh::{self, RelayQuery};
use crate::protocol::Frame;
use crate::signal::{self, SignalQuery};
use crate::state::{now_ms, RelayConfig, RelayState};

/// Health sweep cadence.
const HEALTH_INTERVAL_SECS: u64 = 300;
/// A client whose last relay-driven signal is older than this is stalled.
const CLIENT_STALL_MS: i64 = 60_000;
/// Delay before the listener is reopened after a close.
const RESTART_DELAY_MS: u64 = 300_000;

const FRONT_PAGE: &str = "thanks for testing bittorrent-relay";

pub struct RelayServer {
    state: RelayState,
    dht: Option<DhtSource>,
    serve: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: RelayState::new(config),
            dht: None,
            serve: None,
            tasks: Vec::new(),
        }
    }

    /// Bring the node up: listener, health ticker and, when configured, the
    /// DHT subscription for every digest.
    pub fn start(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let state = &self.state;
        tracing::info!(
            id = state.identity.id.as_str(),
            address = state.identity.address.as_str(),
            web = state.identity.web.as_str(),
            hashes = state.config.hashes.len(),
            "starting relay"
        );
        for (hash, digest) in state.digests.iter() {
            tracing::info!(hash = hash.as_str(), digest = digest.as_str(), "subscribed");
        }

        if state.config.relay {
            let bind = format!("{}:{}", state.config.server, state.config.port).parse()?;
            let digests = state.hashes.keys().cloned().collect();
            let (dht, events) = DhtSource::start(bind, state.config.port, digests)?;
            self.dht = Some(dht);

            let dial_state = state.clone();
            self.tasks.push(tokio::spawn(async move {
                consume_peer_events(dial_state, events).await;
            }));
        } else {
            tracing::info!("dht disabled, mesh grows from inbound peers only");
        }

        let tick_state = state.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(HEALTH_INTERVAL_SECS));
            loop {
                interval.tick().await;
                health_tick(&tick_state);
            }
        }));

        let serve_state = state.clone();
        self.serve = Some(tokio::spawn(async move {
            serve_loop(serve_state).await;
        }));

        Ok(())
    }

    /// Graceful stop: hand clients off, mark this node down across the mesh,
    /// clear the timers and destroy the DHT.
    pub async fn stop(&mut self) {
        self.state.set_stopping();
        self.state.request_http_close();
        if let Some(serve) = self.serve.take() {
            let _ = serve.await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(dht) = self.dht.take() {
            dht.destroy().await;
        }
        tracing::info!("relay stopped");
    }
}

/// Feed DHT sightings into the dialer.
async fn consume_peer_events(state: RelayState, mut events: PeerEvents) {
    while let Some(event) = events.recv().await {
        mesh::on_peer_discovered(&state, &event.host, event.port, &event.digest);
    }
}

/// Bind-serve-handoff loop. A close (cap overflow, `stop()`, listener error)
/// drains the listener; unless the server is stopping, the listener reopens
/// after the scheduled delay.
async fn serve_loop(state: RelayState) {
    loop {
        if state.is_stopping() {
            return;
        }
        let addr = format!("{}:{}", state.config.server, state.config.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(addr = addr.as_str(), error = %e, "listener bind failed");
                if state.is_stopping() {
                    return;
                }
                restart_delay(&state).await;
                continue;
            }
        };
        tracing::info!(addr = addr.as_str(), "http listening");
        broadcast_on(&state);

        let app = router(state.clone());
        let mut close_rx = state.http_close_requested();
        let close_signal = async move {
            loop {
                if *close_rx.borrow_and_update() {
                    return;
                }
                if close_rx.changed().await.is_err() {
                    return;
                }
            }
        };

        // Existing sockets (notably mesh peers) outlive the listener; only
        // the accept loop stops here.
        let mut serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "http server error");
            }
        });
        tokio::select! {
            _ = &mut serve_task => {}
            _ = close_signal => {
                tracing::info!("http close requested");
                serve_task.abort();
            }
        }

        hand_off(&state);

        if state.is_stopping() {
            return;
        }
        state.reset_http_close();
        tracing::info!(delay_ms = RESTART_DELAY_MS, "listener restart scheduled");
        restart_delay(&state).await;
    }
}

/// Wait out the restart timer, waking early when a close (i.e. `stop()`) is
/// requested so shutdown never has to sit through the delay.
async fn restart_delay(state: &RelayState) {
    let mut close_rx = state.http_close_requested();
    tokio::select! {
        _ = tokio::time::sleep(std::time::Duration::from_millis(RESTART_DELAY_MS)) => {}
        _ = async {
            loop {
                if *close_rx.borrow_and_update() {
                    return;
                }
                if close_rx.changed().await.is_err() {
                    return;
                }
            }
        } => {}
    }
}

/// Point every client at a surviving sibling and close it, tell the mesh we
/// are down, and drop all backoff so rediscovery is quick after restart.
pub fn hand_off(state: &RelayState) {
    let clients: Vec<(String, String)> = state
        .clients
        .iter()
        .map(|entry| (entry.id.clone(), entry.hash.clone()))
        .collect();
    for (id, hash) in clients {
        let target = state.random_relay(&hash);
        state.send_to_client(&id, Frame::Relay { relay: target });
        state.close_client(&id);
    }

    let peers: Vec<String> = state.servers.iter().map(|entry| entry.id.clone()).collect();
    for id in peers {
        state.send_to_server(&id, Frame::Off);
    }

    state.clear_all_backoff();
    tracing::info!("hand-off complete");
}

/// Tell the mesh our HTTP listener is (back) up.
fn broadcast_on(state: &RelayState) {
    let peers: Vec<String> = state.servers.iter().map(|entry| entry.id.clone()).collect();
    for id in peers {
        state.send_to_server(&id, Frame::On);
    }
}

/// One health sweep: unresponsive mesh peers are terminated, the rest are
/// pinged; clients stalled mid-exchange are closed.
pub fn health_tick(state: &RelayState) {
    let peers: Vec<(String, bool)> = state
        .servers
        .iter()
        .map(|entry| (entry.id.clone(), entry.active))
        .collect();
    for (id, active) in peers {
        if !active {
            tracing::warn!(peer = id.as_str(), "peer unresponsive, terminating");
            state.close_server(&id);
        } else {
            if let Some(mut conn) = state.servers.get_mut(&id) {
                conn.active = false;
            }
            state.send_to_server(&id, Frame::Ping);
        }
    }

    let cutoff = now_ms() - CLIENT_STALL_MS;
    let stalled: Vec<String> = state
        .clients
        .iter()
        .filter(|entry| entry.stamp.map(|stamp| stamp < cutoff).unwrap_or(false))
        .map(|entry| entry.id.clone())
        .collect();
    for id in stalled {
        tracing::warn!(id = id.as_str(), "client stalled mid-exchange, closing");
        state.close_client(&id);
    }
}

// ── Router ────────────────────────────────────────────────────────────────

pub fn router(state: RelayState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any);

    Router::new()
        .route("/", any(front_page))
        .route("/signal", any(signal_entry))
        .route("/relay", any(relay_entry))
        .fallback(fallback)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn front_page(method: Method) -> Response {
    match method {
        Method::GET => (StatusCode::OK, FRONT_PAGE).into_response(),
        Method::HEAD => StatusCode::OK.into_response(),
        _ => bad_request(),
    }
}

fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, Json("invalid method or path")).into_response()
}

async fn signal_entry(
    State(state): State<RelayState>,
    Query(query): Query<SignalQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| signal::handle_signal_socket(socket, state, query)),
        None => bad_request(),
    }
}

async fn relay_entry(
    State(state): State<RelayState>,
    Query(query): Query<RelayQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| mesh::handle_relay_socket(socket, state, query)),
        None => bad_request(),
    }
}

/// Unknown paths: plain HTTP gets a 400; an upgrade gets one error frame so
/// WebSocket callers see why they were dropped.
async fn fallback(ws: Option<WebSocketUpgrade>) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(Message::Text(Frame::error("route is not supported").to_json()))
                .await;
            let _ = socket.send(Message::Close(None)).await;
        }),
        None => bad_request(),
    }
}
