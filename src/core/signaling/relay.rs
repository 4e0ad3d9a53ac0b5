//! Signaling relay.
//!
//! Validates an inbound signal against the session's ownership rules,
//! advances the session, and forwards the frame to the counterparty through
//! the [`Registry`]. Stations reach this over their socket, receivers over
//! `POST /ice/signal`; both end up in [`SignalingRelay::relay`].
//!
//! Routing:
//! - offer: produced by the target (station), delivered to the initiator
//! - answer: produced by the initiator (receiver), delivered to the bound
//!   target, dropped while unbound
//! - candidate: persisted and delivered to the producer's counterparty;
//!   dropped without persisting while the target is unbound

use crate::core::error::{RelayError, RelayResult};
use crate::core::protocol::api::CandidateView;
use crate::core::protocol::envelope::{Envelope, IceCandidate, IceDescription, SessionDeclined};
use crate::core::protocol::{PeerKey, PeerRole, Signal};
use crate::core::registry::Registry;
use crate::core::signaling::session::{IceSession, SessionStatus, Side};
use crate::core::store::{self, sessions, Db};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// What happened to a relayed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    /// Whether the frame was queued on a live connection.
    pub delivered: bool,
}

pub struct SignalingRelay {
    db: Db,
    registry: Arc<Registry>,
}

impl SignalingRelay {
    pub fn new(db: Db, registry: Arc<Registry>) -> Self {
        Self { db, registry }
    }

    /// Open a session from `initiator` to whichever peer of `target_role`
    /// answers first.
    pub fn create_session(
        &self,
        request_id: Option<&str>,
        initiator: PeerKey,
        target_role: PeerRole,
    ) -> RelayResult<IceSession> {
        let session = IceSession::new(
            Uuid::new_v4().to_string(),
            request_id.map(str::to_string),
            initiator,
            target_role,
            store::now_unix(),
        );
        let conn = store::lock(&self.db);
        sessions::insert_session(&conn, &session)?;
        info!(
            event = "ice_session_created",
            session_id = %session.session_id,
            initiator = %session.initiator,
            target_role = %target_role,
            "ICE session created"
        );
        Ok(session)
    }

    pub async fn relay(&self, caller: &PeerKey, session_id: &str, signal: Signal) -> RelayResult<RelayOutcome> {
        validate(session_id, &signal)?;
        let kind = signal.kind();

        // All state changes happen under one lock; delivery happens after.
        let (status, route) = {
            let conn = store::lock(&self.db);
            let mut session = load(&conn, session_id)?;
            let side = session.authorize(caller)?;

            let route = match signal {
                Signal::Offer(desc) => {
                    if side != Side::Target {
                        return Err(RelayError::Validation(
                            "offers are produced by the session target".into(),
                        ));
                    }
                    session.bind_target(caller);
                    session.record_offer(&desc.sdp);
                    sessions::update_session(&conn, &session)?;
                    session.counterparty(side).map(|to| {
                        let env = Envelope::IceOffer(IceDescription {
                            session_id: session_id.to_string(),
                            session_description: desc,
                        });
                        (to, env)
                    })
                }
                Signal::Answer(desc) => {
                    if side != Side::Initiator {
                        return Err(RelayError::Validation(
                            "answers are produced by the session initiator".into(),
                        ));
                    }
                    session.record_answer(&desc.sdp);
                    sessions::update_session(&conn, &session)?;
                    session.counterparty(side).map(|to| {
                        let env = Envelope::IceAnswer(IceDescription {
                            session_id: session_id.to_string(),
                            session_description: desc,
                        });
                        (to, env)
                    })
                }
                Signal::Candidate(candidate) => {
                    if side == Side::Target && session.bind_target(caller) {
                        sessions::update_session(&conn, &session)?;
                    }
                    match session.counterparty(side) {
                        Some(to) => {
                            sessions::append_candidate(
                                &conn,
                                session_id,
                                caller,
                                &candidate,
                                store::now_unix(),
                            )?;
                            let env = Envelope::IceCandidate(IceCandidate {
                                session_id: session_id.to_string(),
                                ice_candidate: candidate,
                            });
                            Some((to, env))
                        }
                        None => None,
                    }
                }
            };
            (session.status, route)
        };

        let delivered = match route {
            Some((to, env)) => self.registry.push(&to, env).await,
            None => {
                debug!(
                    event = "signal_dropped_unbound",
                    session_id,
                    kind,
                    from = %caller,
                    "No target bound yet, dropping signal"
                );
                false
            }
        };

        debug!(event = "signal_relayed", session_id, kind, from = %caller, delivered, "Signal relayed");
        Ok(RelayOutcome {
            session_id: session_id.to_string(),
            status,
            delivered,
        })
    }

    /// Accept moves the session straight to `accepted`. Decline leaves it as
    /// is and tells the other side.
    pub async fn respond(&self, caller: &PeerKey, session_id: &str, accept: bool) -> RelayResult<RelayOutcome> {
        let (status, notify) = {
            let conn = store::lock(&self.db);
            let mut session = load(&conn, session_id)?;
            let side = session.authorize(caller)?;
            if accept {
                if side == Side::Target && session.bind_target(caller) {
                    debug!(event = "ice_session_bound", session_id, target = %caller, "Target bound on accept");
                }
                session.accept();
                sessions::update_session(&conn, &session)?;
                (session.status, None)
            } else {
                (session.status, session.counterparty(side))
            }
        };

        let mut delivered = false;
        if accept {
            info!(event = "ice_session_accepted", session_id, by = %caller, "Session accepted");
        } else {
            info!(event = "ice_session_declined", session_id, by = %caller, "Session declined");
            if let Some(to) = notify {
                let env = Envelope::SessionDeclined(SessionDeclined {
                    session_id: session_id.to_string(),
                });
                delivered = self.registry.push(&to, env).await;
            }
        }

        Ok(RelayOutcome {
            session_id: session_id.to_string(),
            status,
            delivered,
        })
    }

    /// Persisted candidates the caller has not contributed itself.
    pub fn pending_candidates(&self, caller: &PeerKey, session_id: &str) -> RelayResult<Vec<CandidateView>> {
        let conn = store::lock(&self.db);
        let session = load(&conn, session_id)?;
        session.authorize(caller)?;
        Ok(sessions::candidates_excluding(&conn, session_id, caller)?)
    }
}

fn load(conn: &rusqlite::Connection, session_id: &str) -> RelayResult<IceSession> {
    sessions::get_session(conn, session_id)?
        .ok_or_else(|| RelayError::NotFound(format!("session {session_id}")))
}

fn validate(session_id: &str, signal: &Signal) -> RelayResult<()> {
    if session_id.trim().is_empty() {
        return Err(RelayError::Validation("session_id is required".into()));
    }
    match signal {
        Signal::Offer(desc) | Signal::Answer(desc) if desc.sdp.trim().is_empty() => Err(
            RelayError::Validation(format!("{} without sdp", signal.kind())),
        ),
        Signal::Candidate(c) if c.candidate.trim().is_empty() => {
            Err(RelayError::Validation("empty ice candidate".into()))
        }
        _ => Ok(()),
    }
}
