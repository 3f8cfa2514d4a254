//! Client signaling.
//!
//! Handles `/signal` sessions: accept validation, pairing clients on the same
//! info-hash, and shuttling opaque offer/answer payloads between them. The
//! relay never reads the WebRTC blobs it forwards.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::protocol::Frame;
use crate::state::{now_ms, ClientConn, Outbound, RelayState};

/// Query parameters of `/signal?hash=…&id=…[&want=…]`.
#[derive(Debug, Deserialize)]
pub struct SignalQuery {
    pub hash: Option<String>,
    pub id: Option<String>,
    pub want: Option<String>,
}

/// Default and fallback for the desired-peering count.
const DEFAULT_WANT: usize = 3;

/// Parse the `want` parameter: non-numeric, missing, zero, or out-of-range
/// values all fall back to 3; in-range values are floored.
pub fn clamp_want(raw: Option<&str>) -> usize {
    let parsed = match raw {
        Some(text) => text.trim().parse::<f64>().ok(),
        None => return DEFAULT_WANT,
    };
    match parsed {
        Some(want) if (1.0..=6.0).contains(&want) => want.floor() as usize,
        _ => DEFAULT_WANT,
    }
}

/// Run one `/signal` session for its whole lifetime.
pub async fn handle_signal_socket(socket: WebSocket, state: RelayState, query: SignalQuery) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Writer task: drains the connection's outbound queue.
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

    // ── Accept step ───────────────────────────────────────────────────────

    let reject = |reason: &str| {
        let _ = tx.send(Outbound::Frame(Frame::error(reason)));
        let _ = tx.send(Outbound::Close);
    };

    let (hash, id) = match (&query.hash, &query.id) {
        (Some(hash), Some(id)) if !hash.is_empty() && !id.is_empty() => {
            (hash.clone(), id.clone())
        }
        _ => {
            reject("hash and id are required");
            let _ = writer.await;
            return;
        }
    };

    if !state.subscribed_hash(&hash) {
        reject("hash is not relayed here");
        let _ = writer.await;
        return;
    }

    let want = clamp_want(query.want.as_deref());
    if !state.add_client(ClientConn::new(&id, &hash, want, tx.clone())) {
        reject("id is already connected");
        let _ = writer.await;
        return;
    }

    let cap = state.config.client_connections;
    if cap > 0 && state.client_count() > cap {
        tracing::warn!(cap = cap, "client cap exceeded, draining listener");
        state.request_http_close();
    }

    // Pair immediately with anyone already waiting on this hash.
    match_and_initiate(&state, &id);

    // ── Ingress loop ──────────────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => handle_client_frame(&state, &id, frame),
                Err(e) => {
                    tracing::warn!(id = id.as_str(), error = %e, "bad client frame");
                    state.send_to_client(&id, Frame::error("invalid frame"));
                    break;
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(id = id.as_str(), error = %e, "client socket error");
                break;
            }
            _ => {}
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    disconnect_client(&state, &id);
    writer.abort();
}

/// Dispatch one parsed frame from a client socket.
pub fn handle_client_frame(state: &RelayState, from: &str, frame: Frame) {
    match frame {
        Frame::Proc { req, res } => handle_proc(state, &req, &res),
        Frame::Request { .. } => forward_signal(state, from, frame, false),
        Frame::Response { .. } => forward_signal(state, from, frame, true),
        // Everything else is either relay-generated or mesh traffic; drop it.
        _ => {}
    }
}

/// `proc {req,res}`: both clients completed the peering. Each side moves the
/// counterpart from pending to completed, then either looks for the next
/// partner or, once satisfied, is closed by the relay.
fn handle_proc(state: &RelayState, req: &str, res: &str) {
    for (side, other) in [(req, res), (res, req)] {
        let verdict = {
            let mut conn = match state.clients.get_mut(side) {
                Some(conn) => conn,
                None => continue, // missing targets are dropped silently
            };
            if conn.ids.contains(other) && !conn.web.contains(other) {
                conn.ids.remove(other);
                conn.web.insert(other.to_string());
                conn.stamp = None;
            }
            conn.web.len() < conn.want
        };
        if verdict {
            match_and_initiate(state, side);
        } else {
            tracing::debug!(id = side, "client satisfied, closing");
            state.close_client(side);
        }
    }
}

/// Forward an opaque `request`/`response` frame to its counterpart.
/// `to_req` selects which of the frame's two ids is the destination.
fn forward_signal(state: &RelayState, from: &str, frame: Frame, to_req: bool) {
    let target = match &frame {
        Frame::Request { res, .. } if !to_req => res.clone(),
        Frame::Response { req, .. } if to_req => req.clone(),
        _ => return,
    };

    // Only forward within an exchange this relay initiated.
    let allowed = state
        .clients
        .get(from)
        .map(|conn| conn.ids.contains(&target))
        .unwrap_or(false);
    if !allowed || !state.clients.contains_key(&target) {
        return;
    }

    if state.send_to_client(&target, frame) {
        if let Some(mut sender) = state.clients.get_mut(from) {
            sender.stamp = None;
        }
        if let Some(mut receiver) = state.clients.get_mut(&target) {
            receiver.stamp = Some(now_ms());
        }
    }
}

// ── Signaling broker ──────────────────────────────────────────────────────

/// Pick a waiting partner for `id` and start an offer exchange, or park the
/// client in its hash's offer queue. Tie-breaking is whatever order the
/// waiting set yields.
pub fn match_and_initiate(state: &RelayState, id: &str) {
    let (hash, ids, web) = match state.clients.get(id) {
        Some(conn) => (conn.hash.clone(), conn.ids.clone(), conn.web.clone()),
        None => return,
    };

    let mut partner: Option<String> = None;
    for candidate in state.waiting_for(&hash) {
        if candidate == id || ids.contains(&candidate) || web.contains(&candidate) {
            continue;
        }
        let live = state
            .clients
            .get(&candidate)
            .map(|conn| conn.active)
            .unwrap_or(false);
        if !live {
            // Stale queue entry; drop it and keep looking.
            state.dequeue_offer(&hash, &candidate);
            continue;
        }
        partner = Some(candidate);
        break;
    }

    match partner {
        Some(partner) => {
            state.dequeue_offer(&hash, &partner);
            if let Some(mut conn) = state.clients.get_mut(&partner) {
                conn.ids.insert(id.to_string());
            }
            if let Some(mut conn) = state.clients.get_mut(id) {
                conn.ids.insert(partner.clone());
                conn.stamp = Some(now_ms());
            }
            tracing::debug!(req = id, res = partner.as_str(), "initiating exchange");
            state.send_to_client(
                id,
                Frame::Init {
                    req: id.to_string(),
                    res: partner,
                },
            );
        }
        None => state.enqueue_offer(&hash, id),
    }
}

/// Tear down a closed client: notify pending partners, requeue them by their
/// hash, and drop the client from the registry and its own offer queue.
pub fn disconnect_client(state: &RelayState, id: &str) {
    let (hash, pending) = {
        let mut conn = match state.clients.get_mut(id) {
            Some(conn) => conn,
            None => return,
        };
        conn.active = false;
        (conn.hash.clone(), conn.ids.clone())
    };

    state.dequeue_offer(&hash, id);
    state.remove_client(id);

    for peer in pending {
        let peer_hash = match state.clients.get_mut(&peer) {
            Some(mut conn) => {
                conn.ids.remove(id);
                conn.hash.clone()
            }
            None => continue,
        };
        state.send_to_client(
            &peer,
            Frame::Interrupt { id: id.to_string() },
        );
        state.enqueue_offer(&peer_hash, &peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use crate::state::ConnSender;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn join(state: &RelayState, id: &str, want: usize) -> UnboundedReceiver<Outbound> {
        let (tx, rx): (ConnSender, _) = mpsc::unbounded_channel();
        assert!(state.add_client(ClientConn::new(id, "H", want, tx)));
        match_and_initiate(state, id);
        rx
    }

    fn next_frame(rx: &mut UnboundedReceiver<Outbound>) -> Option<Frame> {
        match rx.try_recv() {
            Ok(Outbound::Frame(frame)) => Some(frame),
            _ => None,
        }
    }

    #[test]
    fn test_want_clamp() {
        assert_eq!(clamp_want(None), 3);
        assert_eq!(clamp_want(Some("99")), 3);
        assert_eq!(clamp_want(Some("0")), 3);
        assert_eq!(clamp_want(Some("4")), 4);
        assert_eq!(clamp_want(Some("4.9")), 4);
        assert_eq!(clamp_want(Some("six")), 3);
        assert_eq!(clamp_want(Some("-2")), 3);
    }

    #[test]
    fn test_first_client_waits() {
        let state = test_state(&["H"]);
        let mut rx = join(&state, "a", 2);
        assert!(next_frame(&mut rx).is_none());
        assert!(state.waiting_for("H").contains("a"));
    }

    #[test]
    fn test_second_client_drains_queue() {
        let state = test_state(&["H"]);
        let mut rx_a = join(&state, "a", 2);
        let mut rx_b = join(&state, "b", 2);

        // The late arrival gets the init frame naming both sides.
        match next_frame(&mut rx_b) {
            Some(Frame::Init { req, res }) => {
                assert_eq!(req, "b");
                assert_eq!(res, "a");
            }
            other => panic!("expected init, got {:?}", other),
        }
        assert!(next_frame(&mut rx_a).is_none());
        assert!(state.waiting_for("H").is_empty());

        // Both sides now hold the exchange as pending.
        assert!(state.clients.get("a").unwrap().ids.contains("b"));
        assert!(state.clients.get("b").unwrap().ids.contains("a"));
        assert!(state.clients.get("b").unwrap().stamp.is_some());
    }

    #[test]
    fn test_proc_completes_both_sides() {
        let state = test_state(&["H"]);
        let _rx_a = join(&state, "a", 2);
        let _rx_b = join(&state, "b", 2);

        handle_proc(&state, "a", "b");

        let a = state.clients.get("a").unwrap();
        let b = state.clients.get("b").unwrap();
        assert!(a.web.contains("b") && a.ids.is_empty());
        assert!(b.web.contains("a") && b.ids.is_empty());
        assert!(a.stamp.is_none() && b.stamp.is_none());
    }

    #[test]
    fn test_proc_closes_satisfied_client() {
        let state = test_state(&["H"]);
        let mut rx_a = join(&state, "a", 1);
        let _rx_b = join(&state, "b", 1);

        handle_proc(&state, "a", "b");

        // want=1 is met; the relay tells the writer to close.
        let mut saw_close = false;
        while let Ok(out) = rx_a.try_recv() {
            if matches!(out, Outbound::Close) {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[test]
    fn test_proc_missing_target_is_dropped() {
        let state = test_state(&["H"]);
        let _rx_a = join(&state, "a", 2);
        // No client "z" anywhere; nothing should panic or change.
        handle_proc(&state, "a", "z");
        assert!(state.clients.get("a").unwrap().web.is_empty());
    }

    #[test]
    fn test_ids_and_web_stay_disjoint() {
        let state = test_state(&["H"]);
        let _rx_a = join(&state, "a", 2);
        let _rx_b = join(&state, "b", 2);

        handle_proc(&state, "a", "b");
        handle_proc(&state, "a", "b"); // duplicate ack

        let a = state.clients.get("a").unwrap();
        assert!(a.ids.is_disjoint(&a.web));
        assert_eq!(a.web.len(), 1);
    }

    #[test]
    fn test_request_forwarded_only_within_exchange() {
        let state = test_state(&["H"]);
        let mut rx_a = join(&state, "a", 2);
        let mut rx_b = join(&state, "b", 2);
        let _ = next_frame(&mut rx_b); // drop the init

        let frame: Frame = serde_json::from_str(
            r#"{"action":"request","req":"b","res":"a","sdp":"offer-blob"}"#,
        )
        .unwrap();
        handle_client_frame(&state, "b", frame);

        // a and b are mid-exchange, so the offer reaches a with its payload.
        match next_frame(&mut rx_a) {
            Some(Frame::Request { req, body, .. }) => {
                assert_eq!(req, "b");
                assert_eq!(body.get("sdp").and_then(|v| v.as_str()), Some("offer-blob"));
            }
            other => panic!("expected forwarded request, got {:?}", other),
        }
        assert!(state.clients.get("a").unwrap().stamp.is_some());
        assert!(state.clients.get("b").unwrap().stamp.is_none());

        // A sender with no pending exchange toward the target is ignored.
        let (tx, _rx_c): (ConnSender, _) = mpsc::unbounded_channel();
        assert!(state.add_client(ClientConn::new("c", "H", 3, tx)));
        let rogue: Frame = serde_json::from_str(
            r#"{"action":"request","req":"c","res":"a","sdp":"rogue"}"#,
        )
        .unwrap();
        handle_client_frame(&state, "c", rogue);
        assert!(next_frame(&mut rx_a).is_none());
    }

    #[test]
    fn test_response_routes_back_to_requester() {
        let state = test_state(&["H"]);
        let _rx_a = join(&state, "a", 2);
        let mut rx_b = join(&state, "b", 2);
        let _ = next_frame(&mut rx_b); // drop the init

        let frame: Frame = serde_json::from_str(
            r#"{"action":"response","req":"b","res":"a","sdp":"answer-blob"}"#,
        )
        .unwrap();
        handle_client_frame(&state, "a", frame);

        match next_frame(&mut rx_b) {
            Some(Frame::Response { res, body, .. }) => {
                assert_eq!(res, "a");
                assert_eq!(body.get("sdp").and_then(|v| v.as_str()), Some("answer-blob"));
            }
            other => panic!("expected forwarded response, got {:?}", other),
        }
        assert!(state.clients.get("b").unwrap().stamp.is_some());
    }

    #[test]
    fn test_disconnect_interrupts_and_requeues_by_hash() {
        let state = test_state(&["H"]);
        let _rx_a = join(&state, "a", 2);
        let mut rx_b = join(&state, "b", 2);
        let _ = next_frame(&mut rx_b);

        disconnect_client(&state, "a");

        match next_frame(&mut rx_b) {
            Some(Frame::Interrupt { id }) => assert_eq!(id, "a"),
            other => panic!("expected interrupt, got {:?}", other),
        }
        // The survivor goes back into its own hash's queue, cleaned of "a".
        assert!(state.waiting_for("H").contains("b"));
        assert!(!state.waiting_for("H").contains("a"));
        assert!(state.clients.get("b").unwrap().ids.is_empty());
        assert!(state.clients.get("a").is_none());
    }

    #[test]
    fn test_queue_never_holds_own_exchange_peers() {
        let state = test_state(&["H"]);
        let _rx_a = join(&state, "a", 2);
        let _rx_b = join(&state, "b", 2);
        let _rx_c = join(&state, "c", 2);

        // c waits; a/b are paired with each other.
        for entry in state.waiting_for("H") {
            let conn = state.clients.get(&entry).unwrap();
            assert!(!conn.ids.contains(&entry));
            assert!(!conn.web.contains(&entry));
        }
        // A queued client is eligible on the next match attempt.
        handle_proc(&state, "a", "b");
        assert!(state.clients.get("a").unwrap().ids.contains("c"));
    }
}
