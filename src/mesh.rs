//! Relay-to-relay mesh.
//!
//! Sibling relays for the same info-hashes find each other through the DHT
//! and hold persistent WebSocket connections. A node is both sides of the
//! mesh at once: it accepts peers on `/relay` and dials peers it discovers.
//! Both directions exchange a `session` frame before the connection counts
//! toward any membership list.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::identity::sha1_hex;
use crate::protocol::Frame;
use crate::state::{Outbound, RelayConn, RelayState};

/// Query parameters of `/relay?hash=<digest>&id=<nodeId>`.
#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    pub hash: Option<String>,
    pub id: Option<String>,
}

/// The identity handshake sent by both sides of a new mesh connection.
pub fn session_frame(state: &RelayState, digest: &str) -> Frame {
    let ident = &state.identity;
    Frame::Session {
        id: ident.id.clone(),
        relay: digest.to_string(),
        address: ident.address.clone(),
        web: ident.web.clone(),
        host: ident.host.clone(),
        port: ident.port,
        domain: ident.domain.clone(),
    }
}

// ── Dialer ────────────────────────────────────────────────────────────────

/// React to a DHT sighting of `host:port` for `digest`.
///
/// Ordered policy: unsubscribed digests and our own address are ignored, the
/// backoff table gates retries, an existing connection (open or still
/// connecting) is never dialed again but may be grafted onto a new digest,
/// and the per-digest peer cap is enforced before a new dial.
pub fn on_peer_discovered(state: &RelayState, host: &str, port: u16, digest: &str) {
    if !state.subscribed_digest(digest) {
        return;
    }

    let addr = format!("{}:{}", host, port);
    let peer_id = sha1_hex(&addr);
    if addr == state.identity.address || peer_id == state.identity.id {
        return;
    }

    if !state.should_try(&peer_id) {
        return;
    }

    if state.servers.contains_key(&peer_id) {
        let mut grafted = false;
        if let Some(mut conn) = state.servers.get_mut(&peer_id) {
            if conn.open && !conn.relays.iter().any(|d| d == digest) {
                conn.relays.push(digest.to_string());
                grafted = true;
            }
        }
        if grafted {
            state.attach_relay(digest, &peer_id);
            state.send_to_server(
                &peer_id,
                Frame::Add {
                    relay: digest.to_string(),
                    reply: true,
                },
            );
        }
        return;
    }

    let cap = state.config.server_connections;
    if cap > 0 && state.relay_count(digest) >= cap {
        return;
    }

    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let conn = RelayConn::new(&peer_id, digest, false, false, tx);
    if !state.add_server(conn) {
        return;
    }

    let state = state.clone();
    let digest = digest.to_string();
    tokio::spawn(async move {
        dial_relay(state, peer_id, addr, digest, rx).await;
    });
}

/// Dial a discovered sibling and run the connection to completion.
async fn dial_relay(
    state: RelayState,
    peer_id: String,
    addr: String,
    digest: String,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let url = format!("ws://{}/relay?hash={}&id={}", addr, digest, state.identity.id);
    tracing::debug!(peer = peer_id.as_str(), url = url.as_str(), "dialing relay");

    let ws_stream = match connect_async(&url).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            tracing::warn!(peer = peer_id.as_str(), error = %e, "relay dial failed");
            state.record_failure(&peer_id);
            state.remove_server(&peer_id);
            return;
        }
    };

    state.clear_backoff(&peer_id);
    if let Some(mut conn) = state.servers.get_mut(&peer_id) {
        conn.open = true;
    }

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Our half of the handshake goes out first.
    let hello = session_frame(&state, &digest).to_json();
    if ws_sender.send(WsMessage::Text(hello.into())).await.is_err() {
        state.record_failure(&peer_id);
        state.remove_server(&peer_id);
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    if ws_sender
                        .send(WsMessage::Text(frame.to_json().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => {
                    if !handle_relay_frame(&state, &peer_id, frame) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = peer_id.as_str(), error = %e, "bad relay frame");
                    break;
                }
            },
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::warn!(peer = peer_id.as_str(), error = %e, "relay socket error");
                state.record_failure(&peer_id);
                break;
            }
            _ => {}
        }
    }

    state.remove_server(&peer_id);
    writer.abort();
}

// ── Inbound accept ────────────────────────────────────────────────────────

/// Run one accepted `/relay` session for its whole lifetime.
pub async fn handle_relay_socket(socket: WebSocket, state: RelayState, query: RelayQuery) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    if ws_sender.send(Message::Text(frame.to_json())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let reject = |reason: &str| {
        let _ = tx.send(Outbound::Frame(Frame::error(reason)));
        let _ = tx.send(Outbound::Close);
    };

    let (digest, peer_id) = match (&query.hash, &query.id) {
        (Some(hash), Some(id)) if !hash.is_empty() && !id.is_empty() => {
            (hash.clone(), id.clone())
        }
        _ => {
            reject("hash and id are required");
            let _ = writer.await;
            return;
        }
    };

    if !state.subscribed_digest(&digest) {
        reject("hash is not relayed here");
        let _ = writer.await;
        return;
    }

    if peer_id == state.identity.id {
        reject("id collision");
        let _ = writer.await;
        return;
    }

    let cap = state.config.server_connections;
    if cap > 0 && state.relay_count(&digest) >= cap {
        reject("relay is full");
        let _ = writer.await;
        return;
    }

    if !state.add_server(RelayConn::new(&peer_id, &digest, true, true, tx.clone())) {
        reject("id collision");
        let _ = writer.await;
        return;
    }

    // Handshake goes out as soon as the peer is registered.
    let _ = tx.send(Outbound::Frame(session_frame(&state, &digest)));

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => {
                    if !handle_relay_frame(&state, &peer_id, frame) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = peer_id.as_str(), error = %e, "bad relay frame");
                    break;
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(peer = peer_id.as_str(), error = %e, "relay socket error");
                state.record_failure(&peer_id);
                break;
            }
            _ => {}
        }
    }

    state.remove_server(&peer_id);
    writer.abort();
}

// ── Shared frame handler ──────────────────────────────────────────────────

/// Apply one frame from a mesh peer. Returns false when the connection must
/// close (spoofed handshake, or no shared digests remain).
pub fn handle_relay_frame(state: &RelayState, peer_id: &str, frame: Frame) -> bool {
    match frame {
        Frame::Session {
            id,
            relay,
            address,
            web,
            host,
            port,
            domain,
        } => {
            // A node id that collides with a subscribed digest is a spoof
            // attempt on the membership tables.
            if state.subscribed_digest(&id) {
                tracing::warn!(peer = peer_id, "session id collides with a digest");
                return false;
            }
            let expected = match state.servers.get(peer_id) {
                Some(conn) => conn.relay.clone(),
                None => return false,
            };
            if relay != expected {
                tracing::warn!(peer = peer_id, relay = relay.as_str(), "unexpected session digest");
                return false;
            }
            if sha1_hex(&address) != id {
                tracing::warn!(peer = peer_id, address = address.as_str(), "session identity mismatch");
                return false;
            }

            match state.servers.get_mut(peer_id) {
                Some(mut conn) => {
                    if !conn.relays.iter().any(|d| d == &relay) {
                        conn.relays.push(relay.clone());
                    }
                    conn.address = address;
                    conn.web = web;
                    conn.host = host;
                    conn.port = port;
                    conn.domain = domain;
                    conn.session = true;
                }
                None => return false,
            }
            state.attach_relay(&relay, peer_id);
            tracing::info!(peer = peer_id, relay = relay.as_str(), "mesh session established");
            true
        }

        Frame::Add { relay, reply } => {
            if state.subscribed_digest(&relay) {
                match state.servers.get_mut(peer_id) {
                    Some(mut conn) => {
                        if !conn.relays.iter().any(|d| d == &relay) {
                            conn.relays.push(relay.clone());
                        }
                    }
                    None => return false,
                }
                state.attach_relay(&relay, peer_id);
                if reply {
                    state.send_to_server(
                        peer_id,
                        Frame::Add {
                            relay,
                            reply: false,
                        },
                    );
                }
            }
            true
        }

        Frame::Sub { relay } => {
            let remaining = match state.servers.get_mut(peer_id) {
                Some(mut conn) => {
                    conn.relays.retain(|d| d != &relay);
                    conn.relays.len()
                }
                None => return false,
            };
            state.detach_relay(&relay, peer_id);
            if remaining == 0 {
                tracing::debug!(peer = peer_id, "no shared digests left, closing");
                state.close_server(peer_id);
                return false;
            }
            true
        }

        Frame::Ping => {
            state.send_to_server(peer_id, Frame::Pong);
            true
        }

        Frame::Pong => {
            if let Some(mut conn) = state.servers.get_mut(peer_id) {
                conn.active = true;
            }
            true
        }

        Frame::On => {
            if let Some(mut conn) = state.servers.get_mut(peer_id) {
                conn.session = true;
            }
            true
        }

        Frame::Off => {
            if let Some(mut conn) = state.servers.get_mut(peer_id) {
                conn.session = false;
            }
            true
        }

        Frame::Error { error } => {
            tracing::debug!(peer = peer_id, error = error.as_str(), "peer reported error");
            true
        }

        // Client-side and unknown actions are noise on a mesh socket.
        _ => true,
    }
}
