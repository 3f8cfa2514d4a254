//! Wire protocol.
//!
//! Every frame on every socket — client or sibling relay — is a UTF-8 JSON
//! object keyed by `action`. The relay never inspects WebRTC session
//! descriptions: `request`/`response` frames keep their remaining fields in a
//! flattened map and are forwarded as-is.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// All frames the relay sends or accepts, tagged by `action`.
///
/// Unknown actions deserialize to [`Frame::Unknown`] and are dropped by the
/// handlers; frames that fail to parse at all close the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Frame {
    /// Relay → client: start an offer exchange between `req` and `res`.
    Init { req: String, res: String },

    /// Client → relay: both sides of `req`/`res` completed a peering.
    Proc { req: String, res: String },

    /// Client → relay → client: opaque offer payload, forwarded to `res`.
    Request {
        req: String,
        res: String,
        #[serde(flatten)]
        body: Map<String, Value>,
    },

    /// Client → relay → client: opaque answer payload, forwarded to `req`.
    Response {
        req: String,
        res: String,
        #[serde(flatten)]
        body: Map<String, Value>,
    },

    /// Relay → client: the peer `id` disconnected mid-exchange.
    Interrupt { id: String },

    /// Relay → client: hand-off address on graceful close (`null` when no
    /// sibling relay is available).
    Relay {
        #[serde(default)]
        relay: Option<String>,
    },

    /// Relay ↔ relay: identity handshake, sent by both sides on open.
    Session {
        id: String,
        relay: String,
        address: String,
        web: String,
        host: String,
        port: u16,
        #[serde(default)]
        domain: Option<String>,
    },

    /// Relay ↔ relay: join this peer into an info-hash membership list.
    Add {
        relay: String,
        #[serde(default)]
        reply: bool,
    },

    /// Relay ↔ relay: leave an info-hash membership list.
    Sub { relay: String },

    Ping,
    Pong,

    /// Relay ↔ relay: the sender's HTTP listener came back up.
    On,
    /// Relay ↔ relay: the sender's HTTP listener is going down.
    Off,

    Error { error: String },

    #[serde(other)]
    Unknown,
}

impl Frame {
    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Frames are built from plain strings and maps; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_frame_shape() {
        let json = Frame::Init {
            req: "a".to_string(),
            res: "b".to_string(),
        }
        .to_json();
        assert!(json.contains("\"action\":\"init\""));
        assert!(json.contains("\"req\":\"a\""));
        assert!(json.contains("\"res\":\"b\""));
    }

    #[test]
    fn test_request_preserves_opaque_payload() {
        let raw = r#"{"action":"request","req":"a","res":"b","sdp":{"type":"offer","candidates":[1,2]}}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        match &frame {
            Frame::Request { req, res, body } => {
                assert_eq!(req, "a");
                assert_eq!(res, "b");
                assert!(body.contains_key("sdp"));
            }
            other => panic!("wrong variant: {:?}", other),
        }

        // The forwarded copy must carry the payload untouched.
        let forwarded: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(forwarded["sdp"]["type"], "offer");
        assert_eq!(forwarded["sdp"]["candidates"][1], 2);
    }

    #[test]
    fn test_unknown_action_is_tolerated() {
        let frame: Frame = serde_json::from_str(r#"{"action":"scrape","hash":"h"}"#).unwrap();
        assert!(matches!(frame, Frame::Unknown));
    }

    #[test]
    fn test_garbage_does_not_parse() {
        assert!(serde_json::from_str::<Frame>("not json").is_err());
        assert!(serde_json::from_str::<Frame>(r#"{"no_action":true}"#).is_err());
        // Known action with missing fields is a protocol violation, not Unknown.
        assert!(serde_json::from_str::<Frame>(r#"{"action":"proc"}"#).is_err());
    }

    #[test]
    fn test_relay_frame_null_handoff() {
        let json = Frame::Relay { relay: None }.to_json();
        assert!(json.contains("\"relay\":null"));

        let json = Frame::Relay {
            relay: Some("relay2.example.com:10509".to_string()),
        }
        .to_json();
        assert!(json.contains("relay2.example.com:10509"));
    }

    #[test]
    fn test_session_frame_optional_domain() {
        let raw = r#"{"action":"session","id":"deadbeef","relay":"d1","address":"10.0.0.1:10509","web":"10.0.0.1:10509","host":"10.0.0.1","port":10509}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        match frame {
            Frame::Session { domain, port, .. } => {
                assert!(domain.is_none());
                assert_eq!(port, 10509);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unit_actions() {
        assert!(matches!(
            serde_json::from_str::<Frame>(r#"{"action":"ping"}"#).unwrap(),
            Frame::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<Frame>(r#"{"action":"off"}"#).unwrap(),
            Frame::Off
        ));
        assert_eq!(Frame::Pong.to_json(), r#"{"action":"pong"}"#);
    }

    #[test]
    fn test_add_reply_defaults_false() {
        let frame: Frame = serde_json::from_str(r#"{"action":"add","relay":"d1"}"#).unwrap();
        match frame {
            Frame::Add { relay, reply } => {
                assert_eq!(relay, "d1");
                assert!(!reply);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }
}
