//! Wire types shared by the server and both client roles.
//!
//! - [`envelope`]: the WebSocket `{type, payload}` envelope as a tagged union.
//! - [`api`]: JSON bodies of the HTTP surface.

pub mod api;
pub mod envelope;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Which side of the system a peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Data-producing peer (a.k.a. collector).
    Station,
    /// Data-consuming peer.
    Receiver,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Station => "station",
            PeerRole::Receiver => "receiver",
        }
    }
}

impl Display for PeerRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "station" | "collector" => Ok(PeerRole::Station),
            "receiver" => Ok(PeerRole::Receiver),
            other => Err(anyhow::anyhow!("unknown peer role '{other}'")),
        }
    }
}

/// Identity of a live peer: role plus id. Station and receiver ids live in
/// separate namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerKey {
    pub role: PeerRole,
    pub id: String,
}

impl PeerKey {
    pub fn station(id: impl Into<String>) -> Self {
        Self {
            role: PeerRole::Station,
            id: id.into(),
        }
    }

    pub fn receiver(id: impl Into<String>) -> Self {
        Self {
            role: PeerRole::Receiver,
            id: id.into(),
        }
    }
}

impl Display for PeerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.role, self.id)
    }
}

impl FromStr for PeerKey {
    type Err = anyhow::Error;

    /// Parses `role:id`, the format used in the token table.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, id) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected 'role:id', got '{s}'"))?;
        if id.is_empty() {
            anyhow::bail!("empty peer id in '{s}'");
        }
        Ok(Self {
            role: role.parse()?,
            id: id.to_string(),
        })
    }
}

/// Per-station outcome of a data request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Processing,
    Ready,
    Error,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Processing => "processing",
            ResponseStatus::Ready => "ready",
            ResponseStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(ResponseStatus::Processing),
            "ready" => Some(ResponseStatus::Ready),
            "error" => Some(ResponseStatus::Error),
            _ => None,
        }
    }
}

/// How the receiver wants ready files delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Server streams the station's advertised download URL.
    #[default]
    Proxy,
    /// Peer-to-peer data channel negotiated through the relay.
    Direct,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Proxy => "proxy",
            TransferMode::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proxy" => Some(TransferMode::Proxy),
            "direct" => Some(TransferMode::Direct),
            _ => None,
        }
    }
}

/// SDP kind carried in a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// `{type, sdp}` as produced by browsers and webrtc-rs alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(default, rename = "sdpMid", alias = "sdp_mid")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", alias = "sdp_mline_index")]
    pub sdp_mline_index: Option<u16>,
}

/// One signaling frame as seen by the relay and the negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidatePayload),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::Candidate(_) => "candidate",
        }
    }
}

/// A locally produced signal that must reach the counterparty of `session_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSignal {
    pub session_id: String,
    pub signal: Signal,
}
