//! ICE session state.
//!
//! A session is opened by an initiator for a target *role*; the concrete
//! target binds lazily on the first qualifying signal from that role.
//! Status only ever moves forward:
//!
//! ```text
//! pending → offer_received → answer_received → accepted
//!     └──────────── accept (from any state) ──────────┘
//! ```

use crate::core::error::{RelayError, RelayResult};
use crate::core::protocol::{PeerKey, PeerRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    Pending,
    OfferReceived,
    AnswerReceived,
    Accepted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::OfferReceived => "offer_received",
            SessionStatus::AnswerReceived => "answer_received",
            SessionStatus::Accepted => "accepted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionStatus::Pending),
            "offer_received" => Some(SessionStatus::OfferReceived),
            "answer_received" => Some(SessionStatus::AnswerReceived),
            "accepted" => Some(SessionStatus::Accepted),
            _ => None,
        }
    }
}

/// Which end of a session a caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Initiator,
    Target,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceSession {
    pub session_id: String,
    pub request_id: Option<String>,
    pub initiator: PeerKey,
    pub target_role: PeerRole,
    pub target_id: Option<String>,
    pub status: SessionStatus,
    pub offer_sdp: Option<String>,
    pub answer_sdp: Option<String>,
    pub created_at: i64,
}

impl IceSession {
    pub fn new(
        session_id: impl Into<String>,
        request_id: Option<String>,
        initiator: PeerKey,
        target_role: PeerRole,
        created_at: i64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            request_id,
            initiator,
            target_role,
            target_id: None,
            status: SessionStatus::Pending,
            offer_sdp: None,
            answer_sdp: None,
            created_at,
        }
    }

    pub fn target(&self) -> Option<PeerKey> {
        self.target_id.as_ref().map(|id| PeerKey {
            role: self.target_role,
            id: id.clone(),
        })
    }

    /// Resolve which side `caller` is on, or reject it.
    pub fn authorize(&self, caller: &PeerKey) -> RelayResult<Side> {
        if *caller == self.initiator {
            return Ok(Side::Initiator);
        }
        if caller.role == self.target_role {
            match &self.target_id {
                None => return Ok(Side::Target),
                Some(bound) if *bound == caller.id => return Ok(Side::Target),
                Some(_) => {}
            }
        }
        Err(RelayError::Authorization(format!(
            "{caller} may not signal on session {}",
            self.session_id
        )))
    }

    /// Bind the target to `caller` if nothing is bound yet. First responder wins.
    pub fn bind_target(&mut self, caller: &PeerKey) -> bool {
        if self.target_id.is_none() && caller.role == self.target_role {
            self.target_id = Some(caller.id.clone());
            return true;
        }
        false
    }

    /// The peer that should receive a frame produced by `side`.
    pub fn counterparty(&self, side: Side) -> Option<PeerKey> {
        match side {
            Side::Initiator => self.target(),
            Side::Target => Some(self.initiator.clone()),
        }
    }

    fn advance(&mut self, to: SessionStatus) {
        self.status = self.status.max(to);
    }

    pub fn record_offer(&mut self, sdp: &str) {
        self.offer_sdp = Some(sdp.to_string());
        self.advance(SessionStatus::OfferReceived);
    }

    /// An answer with no prior offer is still accepted.
    pub fn record_answer(&mut self, sdp: &str) {
        self.answer_sdp = Some(sdp.to_string());
        self.advance(SessionStatus::AnswerReceived);
    }

    pub fn accept(&mut self) {
        self.advance(SessionStatus::Accepted);
    }
}
