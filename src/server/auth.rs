//! Static token table standing in for credential issuance.
//!
//! Every token maps to exactly one peer identity. WebSocket peers prove the
//! identity they claim in their auth frame; HTTP callers are identified by
//! `Authorization: Bearer <token>` alone.

use crate::core::protocol::PeerKey;
use anyhow::{Context, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, PeerKey>,
}

impl TokenTable {
    /// Build from the `[tokens]` config map: token → `"role:id"`.
    pub fn from_config(entries: &HashMap<String, String>) -> Result<Self> {
        let mut tokens = HashMap::with_capacity(entries.len());
        for (token, peer) in entries {
            if token.is_empty() {
                anyhow::bail!("empty token for peer '{peer}'");
            }
            let key: PeerKey = peer
                .parse()
                .with_context(|| format!("invalid peer for token entry '{peer}'"))?;
            tokens.insert(token.clone(), key);
        }
        Ok(Self { tokens })
    }

    pub fn insert(&mut self, token: impl Into<String>, peer: PeerKey) {
        self.tokens.insert(token.into(), peer);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Identity bound to `token`.
    pub fn identify(&self, token: &str) -> Option<&PeerKey> {
        self.tokens.get(token)
    }

    /// Check a WebSocket auth frame: the token must belong to `claimed`.
    pub fn verify(&self, claimed: &PeerKey, token: &str) -> Result<(), &'static str> {
        match self.identify(token) {
            Some(key) if key == claimed => Ok(()),
            Some(_) => Err("token does not match the claimed identity"),
            None => Err("unknown token"),
        }
    }

    /// Resolve the caller of an HTTP request from its header block.
    pub fn bearer(&self, headers: &str) -> Option<&PeerKey> {
        let token = headers.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if !name.trim().eq_ignore_ascii_case("authorization") {
                return None;
            }
            let value = value.trim();
            let (scheme, token) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })?;
        self.identify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TokenTable {
        let mut entries = HashMap::new();
        entries.insert("tok-a".to_string(), "station:A".to_string());
        entries.insert("tok-rx".to_string(), "receiver:rx".to_string());
        TokenTable::from_config(&entries).unwrap()
    }

    #[test]
    fn verify_requires_matching_identity() {
        let t = table();
        assert!(t.verify(&PeerKey::station("A"), "tok-a").is_ok());
        assert!(t.verify(&PeerKey::station("B"), "tok-a").is_err());
        assert!(t.verify(&PeerKey::receiver("A"), "tok-a").is_err());
        assert_eq!(t.verify(&PeerKey::station("A"), "nope"), Err("unknown token"));
    }

    #[test]
    fn bearer_header_is_case_insensitive() {
        let t = table();
        let headers = "GET /health HTTP/1.1\r\nHost: x\r\nauthorization: bearer tok-rx\r\n";
        assert_eq!(t.bearer(headers), Some(&PeerKey::receiver("rx")));
        assert_eq!(t.bearer("GET / HTTP/1.1\r\nAuthorization: Basic abc\r\n"), None);
        assert_eq!(t.bearer("GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn malformed_entries_are_rejected() {
        let mut entries = HashMap::new();
        entries.insert("t".to_string(), "operator:x".to_string());
        assert!(TokenTable::from_config(&entries).is_err());
    }
}
