//! NegotiationEngine: per-session WebRTC peer connections driven by relayed
//! signals.
//!
//! # Model
//!
//! - One [`RTCPeerConnection`] per session id, created on demand by the
//!   station ([`sender`]) or the receiver ([`receiver`]) flow
//! - A single-slot waiter per session id for the remote description. A
//!   second registration replaces the first (last registrar wins); a
//!   description that arrives before anyone waits is parked in the slot
//! - Local candidates are trickled out through the `OutgoingSignal` sink as
//!   soon as they are gathered
//! - Remote candidates are applied to the matching connection, parked while
//!   it still lacks a remote description, and dropped when no connection
//!   exists for the session

mod initializer;
pub mod receiver;
pub mod sender;

use crate::core::protocol::{IceCandidatePayload, OutgoingSignal, SessionDescription};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tracing::{debug, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

use initializer::{build_peer_connection, candidate_init, create_webrtc_api, to_rtc_description};

enum WaiterSlot {
    Waiting(oneshot::Sender<SessionDescription>),
    Arrived(SessionDescription),
}

pub struct NegotiationEngine {
    api: API,
    peers: RwLock<HashMap<String, Arc<RTCPeerConnection>>>,
    waiters: RwLock<HashMap<String, WaiterSlot>>,
    pending: Mutex<HashMap<String, Vec<RTCIceCandidateInit>>>,
    signal_tx: mpsc::UnboundedSender<OutgoingSignal>,
}

impl NegotiationEngine {
    /// Locally produced offers, answers and candidates are written to
    /// `signal_tx`; the owner forwards them to the relay.
    pub fn new(signal_tx: mpsc::UnboundedSender<OutgoingSignal>) -> Result<Self> {
        Ok(Self {
            api: create_webrtc_api()?,
            peers: RwLock::new(HashMap::new()),
            waiters: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            signal_tx,
        })
    }

    // ── Waiters ──────────────────────────────────────────────────────────────

    /// Wait for the remote description of `session_id`.
    pub async fn register_waiter(&self, session_id: &str) -> oneshot::Receiver<SessionDescription> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.write().await;
        match waiters.remove(session_id) {
            Some(WaiterSlot::Arrived(desc)) => {
                let _ = tx.send(desc);
            }
            previous => {
                if matches!(previous, Some(WaiterSlot::Waiting(_))) {
                    debug!(event = "waiter_replaced", session_id, "Earlier waiter replaced");
                }
                waiters.insert(session_id.to_string(), WaiterSlot::Waiting(tx));
            }
        }
        rx
    }

    /// Hand a relayed offer or answer to whoever waits on `session_id`.
    /// Returns `false` when nobody is waiting yet and the description was
    /// parked for a later [`register_waiter`](Self::register_waiter).
    pub async fn resolve_remote_description(&self, session_id: &str, desc: SessionDescription) -> bool {
        let mut waiters = self.waiters.write().await;
        match waiters.remove(session_id) {
            Some(WaiterSlot::Waiting(tx)) => match tx.send(desc) {
                Ok(()) => true,
                Err(desc) => {
                    // The waiter gave up; keep the description for a retry.
                    waiters.insert(session_id.to_string(), WaiterSlot::Arrived(desc));
                    false
                }
            },
            Some(WaiterSlot::Arrived(_)) | None => {
                waiters.insert(session_id.to_string(), WaiterSlot::Arrived(desc));
                false
            }
        }
    }

    // ── Candidates ───────────────────────────────────────────────────────────

    /// Apply a relayed candidate. `Ok(false)` means it was dropped because
    /// the session has no peer connection on this side.
    pub async fn add_remote_candidate(&self, session_id: &str, payload: &IceCandidatePayload) -> Result<bool> {
        let Some(pc) = self.peer(session_id).await else {
            debug!(event = "ice_candidate_unknown_session", session_id, "Candidate for unknown session dropped");
            return Ok(false);
        };
        let init = candidate_init(payload);

        let mut pending = self.pending.lock().await;
        if pc.remote_description().await.is_none() {
            pending.entry(session_id.to_string()).or_default().push(init);
            return Ok(true);
        }
        drop(pending);

        pc.add_ice_candidate(init)
            .await
            .context("adding remote ICE candidate")?;
        Ok(true)
    }

    async fn apply_remote(&self, session_id: &str, pc: &RTCPeerConnection, desc: &SessionDescription) -> Result<()> {
        pc.set_remote_description(to_rtc_description(desc)?)
            .await
            .context("setting remote description")?;

        let mut pending = self.pending.lock().await;
        for init in pending.remove(session_id).unwrap_or_default() {
            if let Err(e) = pc.add_ice_candidate(init).await {
                warn!(event = "ice_candidate_rejected", session_id, error = %e, "Parked candidate rejected");
            }
        }
        Ok(())
    }

    // ── Peer connections ─────────────────────────────────────────────────────

    async fn new_peer_connection(&self, session_id: &str) -> Result<(Arc<RTCPeerConnection>, Arc<Notify>)> {
        let (pc, failed) = build_peer_connection(&self.api, session_id, self.signal_tx.clone()).await?;
        if let Some(old) = self
            .peers
            .write()
            .await
            .insert(session_id.to_string(), pc.clone())
        {
            warn!(event = "peer_connection_replaced", session_id, "Session already had a peer connection");
            let _ = old.close().await;
        }
        Ok((pc, failed))
    }

    async fn peer(&self, session_id: &str) -> Option<Arc<RTCPeerConnection>> {
        self.peers.read().await.get(session_id).cloned()
    }

    fn emit(&self, signal: OutgoingSignal) -> Result<()> {
        self.signal_tx
            .send(signal)
            .map_err(|_| anyhow::anyhow!("signal sink closed"))
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        self.peers.read().await.contains_key(session_id)
    }

    /// Tear down everything held for `session_id`.
    pub async fn close_session(&self, session_id: &str) {
        self.waiters.write().await.remove(session_id);
        self.pending.lock().await.remove(session_id);
        let pc = self.peers.write().await.remove(session_id);
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                debug!(event = "peer_connection_close_failure", session_id, error = %e, "Peer connection close failed");
            }
        }
    }
}
