//! Node identity derivation.
//!
//! A relay node is identified by the SHA-1 of its `host:port` address.
//! The same digest function keys the mesh: every subscribed info-hash is
//! announced and matched by its lowercase-hex SHA-1.

use sha1::{Digest, Sha1};

/// Lowercase-hex SHA-1 of an arbitrary string.
pub fn sha1_hex(input: &str) -> String {
    hex::encode(Sha1::digest(input.as_bytes()))
}

/// This node's identity, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// `host:port` — the dialable address other relays use.
    pub address: String,
    /// `domain-or-host:port` — the public address handed to clients.
    pub web: String,
    /// SHA-1 hex of `address`; the node id in the mesh.
    pub id: String,
    pub host: String,
    pub port: u16,
    pub domain: Option<String>,
}

impl NodeIdentity {
    pub fn new(host: &str, port: u16, domain: Option<String>) -> Self {
        let address = format!("{}:{}", host, port);
        let web = match &domain {
            Some(d) => format!("{}:{}", d, port),
            None => address.clone(),
        };
        Self {
            id: sha1_hex(&address),
            address,
            web,
            host: host.to_string(),
            port,
            domain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_hex_known_vector() {
        // sha1("abc")
        assert_eq!(sha1_hex("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_identity_from_host_port() {
        let ident = NodeIdentity::new("203.0.113.7", 10509, None);
        assert_eq!(ident.address, "203.0.113.7:10509");
        assert_eq!(ident.web, "203.0.113.7:10509");
        assert_eq!(ident.id, sha1_hex("203.0.113.7:10509"));
        assert_eq!(ident.id.len(), 40);
    }

    #[test]
    fn test_domain_only_changes_web() {
        let plain = NodeIdentity::new("203.0.113.7", 10509, None);
        let named = NodeIdentity::new("203.0.113.7", 10509, Some("relay.example.com".to_string()));
        assert_eq!(named.web, "relay.example.com:10509");
        assert_eq!(named.address, plain.address);
        assert_eq!(named.id, plain.id);
    }
}
