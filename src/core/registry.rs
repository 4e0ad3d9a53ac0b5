//! Connection registry: live peer key → outbound queue.
//!
//! Every authenticated socket registers a [`PeerHandle`] whose sender feeds
//! that socket's single writer task. At most one handle exists per key; a
//! reconnect replaces the previous entry without closing the old socket.
//! Teardown goes through [`Registry::release`], which only removes the entry
//! if it still belongs to the connection being torn down, so a stale socket
//! closing late never evicts its replacement.

use crate::core::error::RelayResult;
use crate::core::protocol::envelope::Envelope;
use crate::core::protocol::{PeerKey, PeerRole};
use crate::core::store::{self, stations, Db};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound side of one live connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub connection_id: Uuid,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl PeerHandle {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            tx,
        }
    }

    /// Queue an envelope for the writer task. `false` once the socket is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

pub struct Registry {
    peers: RwLock<HashMap<PeerKey, PeerHandle>>,
    db: Db,
}

impl Registry {
    pub fn new(db: Db) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            db,
        }
    }

    /// Install `handle` for `peer`, returning the handle it replaced.
    pub async fn register(&self, peer: PeerKey, handle: PeerHandle) -> RelayResult<Option<PeerHandle>> {
        let connection_id = handle.connection_id;
        // Status writes happen under the map lock so they order with `release`.
        let previous = {
            let mut peers = self.peers.write().await;
            if peer.role == PeerRole::Station {
                let conn = store::lock(&self.db);
                stations::mark_connected(&conn, &peer.id, store::now_unix())?;
            }
            peers.insert(peer.clone(), handle)
        };

        if let Some(old) = &previous {
            info!(
                event = "peer_replaced",
                peer = %peer,
                old_connection = %old.connection_id,
                new_connection = %connection_id,
                "Peer reconnected, previous connection superseded"
            );
        } else {
            info!(event = "peer_registered", peer = %peer, connection = %connection_id, "Peer registered");
        }
        Ok(previous)
    }

    pub async fn lookup(&self, peer: &PeerKey) -> Option<PeerHandle> {
        self.peers.read().await.get(peer).cloned()
    }

    /// Remove `peer` unconditionally. Idempotent.
    pub async fn unregister(&self, peer: &PeerKey) -> RelayResult<()> {
        let removed = {
            let mut peers = self.peers.write().await;
            self.mark_disconnected(peer)?;
            peers.remove(peer)
        };
        if removed.is_some() {
            info!(event = "peer_unregistered", peer = %peer, "Peer unregistered");
        }
        Ok(())
    }

    /// Remove `peer` only if its entry still belongs to `connection_id`.
    ///
    /// Returns `true` if the entry was removed.
    pub async fn release(&self, peer: &PeerKey, connection_id: Uuid) -> RelayResult<bool> {
        {
            let mut peers = self.peers.write().await;
            match peers.get(peer) {
                Some(handle) if handle.connection_id == connection_id => {
                    peers.remove(peer);
                    self.mark_disconnected(peer)?;
                }
                Some(_) => {
                    debug!(
                        event = "release_skipped",
                        peer = %peer,
                        connection = %connection_id,
                        "Stale connection closed after being replaced"
                    );
                    return Ok(false);
                }
                None => return Ok(false),
            }
        }
        info!(event = "peer_released", peer = %peer, connection = %connection_id, "Peer disconnected");
        Ok(true)
    }

    /// Best-effort delivery. A missing or closed connection is logged, not an error.
    pub async fn push(&self, peer: &PeerKey, envelope: Envelope) -> bool {
        let kind = envelope.kind();
        let Some(handle) = self.lookup(peer).await else {
            debug!(event = "push_no_peer", peer = %peer, kind, "Peer not connected, dropping envelope");
            return false;
        };
        if handle.send(envelope) {
            debug!(event = "push_delivered", peer = %peer, kind, "Envelope queued");
            true
        } else {
            warn!(event = "push_closed", peer = %peer, kind, "Peer writer already closed, dropping envelope");
            false
        }
    }

    /// Ids of live peers with the given role.
    pub async fn connected(&self, role: PeerRole) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .read()
            .await
            .keys()
            .filter(|k| k.role == role)
            .map(|k| k.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn mark_disconnected(&self, peer: &PeerKey) -> RelayResult<()> {
        if peer.role == PeerRole::Station {
            let conn = store::lock(&self.db);
            stations::mark_disconnected(&conn, &peer.id)?;
        }
        Ok(())
    }
}
