//! WebSocket surface for stations and receivers.
//!
//! Per connection:
//! 1. WebSocket upgrade.
//! 2. First frame must be `collector_auth` or `receiver_auth` within
//!    [`AUTH_HANDSHAKE_TIMEOUT`]; a bad token gets `auth_failure` and a close.
//! 3. The peer is registered and a writer task drains its outbound queue.
//!    Everything sent to the socket goes through that queue.
//! 4. The read loop dispatches frames until the socket closes.
//!
//! Each connection runs under a supervisor that awaits the task, so a panic
//! inside the handler ends in the same cleanup as a normal close: the
//! registry entry is released only if it still belongs to this connection.

use super::ServerState;
use crate::core::config::AUTH_HANDSHAKE_TIMEOUT;
use crate::core::error::{RelayError, RelayResult};
use crate::core::protocol::envelope::{AuthFailure, AuthSuccess, Envelope, HeartbeatResponse};
use crate::core::protocol::{PeerKey, PeerRole, Signal};
use crate::core::registry::PeerHandle;
use crate::core::store::{self, stations};
use anyhow::{anyhow, Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

pub async fn serve(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                warn!(event = "ws_accept_failure", error = %e, "Failed to accept connection");
                continue;
            }
        };
        tokio::spawn(supervise(stream, addr, state.clone()));
    }
}

/// Run one connection and clean up after it, panic or not.
async fn supervise(stream: TcpStream, addr: SocketAddr, state: Arc<ServerState>) {
    let (registered_tx, mut registered_rx) = oneshot::channel::<(PeerKey, Uuid)>();
    let task = tokio::spawn(handle_connection(stream, addr, state.clone(), registered_tx));

    match task.await {
        Ok(Ok(())) => debug!(event = "ws_closed", %addr, "Connection closed"),
        Ok(Err(e)) => warn!(event = "ws_error", %addr, error = %e, "Connection ended with error"),
        Err(e) if e.is_panic() => {
            error!(event = "ws_panic", %addr, "Connection handler panicked, closing")
        }
        Err(e) => warn!(event = "ws_cancelled", %addr, error = %e, "Connection task cancelled"),
    }

    if let Ok((peer, connection_id)) = registered_rx.try_recv() {
        if let Err(e) = state.registry.release(&peer, connection_id).await {
            warn!(event = "ws_release_failure", peer = %peer, error = %e, "Failed to release peer");
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
    registered: oneshot::Sender<(PeerKey, Uuid)>,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake with {addr}"))?;
    let (mut sink, mut read) = ws.split();

    let Some(peer) = authenticate(&mut sink, &mut read, &state).await? else {
        let _ = sink.close().await;
        return Ok(());
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let handle = PeerHandle::new(tx.clone());
    let connection_id = handle.connection_id;
    if let Err(e) = state.registry.register(peer.clone(), handle).await {
        send_now(&mut sink, &Envelope::error(e.message())).await?;
        return Err(anyhow!("registering {peer}: {e}"));
    }
    // The supervisor only needs this for cleanup; it outlives us.
    let _ = registered.send((peer.clone(), connection_id));

    let _ = tx.send(Envelope::AuthSuccess(AuthSuccess {
        peer_id: peer.id.clone(),
        role: peer.role,
    }));
    info!(event = "ws_authenticated", peer = %peer, %addr, connection = %connection_id, "Peer authenticated");

    let writer_peer = peer.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match envelope.encode() {
                Ok(t) => t,
                Err(e) => {
                    warn!(event = "ws_encode_failure", peer = %writer_peer, error = %e, "Dropping unencodable envelope");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::text(text)).await {
                debug!(event = "ws_write_failure", peer = %writer_peer, error = %e, "Writer stopped");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = read.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                let _ = tx.send(Envelope::error("binary frames are not supported"));
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(event = "ws_read_failure", peer = %peer, error = %e, "Read failed");
                break;
            }
        };

        let envelope = match Envelope::decode(text.as_str()) {
            Ok(env) => env,
            Err(e) => {
                debug!(event = "ws_bad_frame", peer = %peer, error = %e, "Rejected frame");
                let _ = tx.send(Envelope::error(format!("{e:#}")));
                continue;
            }
        };

        if let Err(e) = dispatch(&state, &peer, envelope, &tx).await {
            if e.is_client_error() {
                debug!(event = "ws_client_error", peer = %peer, error = %e, "Rejected message");
            } else {
                warn!(event = "ws_dispatch_failure", peer = %peer, error = %e, "Message handling failed");
            }
            let _ = tx.send(Envelope::error(e.message()));
        }
    }

    writer.abort();
    Ok(())
}

/// Read and verify the auth frame. `Ok(None)` means the peer was refused
/// and already told why.
async fn authenticate(
    sink: &mut WsSink,
    read: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    state: &ServerState,
) -> Result<Option<PeerKey>> {
    let first = match tokio::time::timeout(AUTH_HANDSHAKE_TIMEOUT, read.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_))) => {
            refuse(sink, "first message must be an auth frame").await?;
            return Ok(None);
        }
        Ok(Some(Err(e))) => return Err(anyhow!("reading auth frame: {e}")),
        Ok(None) => return Ok(None),
        Err(_) => {
            refuse(sink, "auth timeout").await?;
            return Ok(None);
        }
    };

    let (claimed, token) = match Envelope::decode(first.as_str()) {
        Ok(Envelope::CollectorAuth(auth)) => (PeerKey::station(auth.station_id), auth.token),
        Ok(Envelope::ReceiverAuth(auth)) => (PeerKey::receiver(auth.receiver_id), auth.token),
        Ok(_) | Err(_) => {
            refuse(sink, "first message must be an auth frame").await?;
            return Ok(None);
        }
    };

    if claimed.id.trim().is_empty() {
        refuse(sink, "empty peer id").await?;
        return Ok(None);
    }
    if let Err(reason) = state.tokens.verify(&claimed, &token) {
        warn!(event = "ws_auth_failure", peer = %claimed, reason, "Authentication failed");
        refuse(sink, reason).await?;
        return Ok(None);
    }
    Ok(Some(claimed))
}

async fn refuse(sink: &mut WsSink, reason: &str) -> Result<()> {
    send_now(
        sink,
        &Envelope::AuthFailure(AuthFailure {
            reason: reason.to_string(),
        }),
    )
    .await
}

/// Direct write, only used before the writer task exists.
async fn send_now(sink: &mut WsSink, envelope: &Envelope) -> Result<()> {
    sink.send(Message::text(envelope.encode()?)).await?;
    Ok(())
}

async fn dispatch(
    state: &ServerState,
    peer: &PeerKey,
    envelope: Envelope,
    tx: &mpsc::UnboundedSender<Envelope>,
) -> RelayResult<()> {
    match envelope {
        Envelope::Heartbeat(_) => {
            let now = store::now_unix();
            if peer.role == PeerRole::Station {
                let conn = store::lock(&state.db);
                stations::record_heartbeat(&conn, &peer.id, now)?;
            }
            let _ = tx.send(Envelope::HeartbeatResponse(HeartbeatResponse {
                timestamp: now.max(0) as u64,
            }));
            Ok(())
        }
        Envelope::DataResponse(resp) => state.fanout.handle_response(peer, resp).await,
        Envelope::IceOffer(msg) => {
            let signal = Signal::Offer(msg.session_description);
            state.relay.relay(peer, &msg.session_id, signal).await.map(|_| ())
        }
        Envelope::IceAnswer(msg) => {
            let signal = Signal::Answer(msg.session_description);
            state.relay.relay(peer, &msg.session_id, signal).await.map(|_| ())
        }
        Envelope::IceCandidate(msg) => {
            let signal = Signal::Candidate(msg.ice_candidate);
            state.relay.relay(peer, &msg.session_id, signal).await.map(|_| ())
        }
        other => Err(RelayError::Validation(format!(
            "unexpected '{}' from {}",
            other.kind(),
            peer.role
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::envelope::{CollectorAuth, Heartbeat, ReceiverAuth};
    use crate::server::auth::TokenTable;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    async fn start() -> (SocketAddr, Arc<ServerState>) {
        let mut tokens = TokenTable::default();
        tokens.insert("tok-a", PeerKey::station("A"));
        tokens.insert("tok-rx", PeerKey::receiver("rx"));
        let state = ServerState::new(store::open_in_memory().unwrap(), tokens);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state.clone()));
        (addr, state)
    }

    async fn next_envelope<S>(read: &mut S) -> Envelope
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), read.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                return Envelope::decode(text.as_str()).unwrap();
            }
        }
    }

    async fn send<S>(write: &mut S, env: Envelope)
    where
        S: futures_util::Sink<Message> + Unpin,
        S::Error: std::fmt::Debug,
    {
        write.send(Message::text(env.encode().unwrap())).await.unwrap();
    }

    #[tokio::test]
    async fn station_handshake_heartbeat_and_cleanup() {
        let (addr, state) = start().await;
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (mut write, mut read) = ws.split();

        send(
            &mut write,
            Envelope::CollectorAuth(CollectorAuth {
                station_id: "A".into(),
                token: "tok-a".into(),
            }),
        )
        .await;
        match next_envelope(&mut read).await {
            Envelope::AuthSuccess(ok) => assert_eq!(ok.peer_id, "A"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(state.registry.lookup(&PeerKey::station("A")).await.is_some());

        send(&mut write, Envelope::Heartbeat(Heartbeat::default())).await;
        assert!(matches!(
            next_envelope(&mut read).await,
            Envelope::HeartbeatResponse(_)
        ));

        // Unexpected kinds get an error envelope, not a close.
        send(&mut write, Envelope::error("bogus")).await;
        assert!(matches!(next_envelope(&mut read).await, Envelope::Error(_)));

        write.close().await.unwrap();
        drop(read);
        for _ in 0..50 {
            if state.registry.lookup(&PeerKey::station("A")).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(state.registry.lookup(&PeerKey::station("A")).await.is_none());
        let conn = store::lock(&state.db);
        assert!(!stations::get_station(&conn, "A").unwrap().unwrap().connected);
    }

    #[tokio::test]
    async fn wrong_identity_gets_auth_failure() {
        let (addr, state) = start().await;
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (mut write, mut read) = ws.split();

        send(
            &mut write,
            Envelope::ReceiverAuth(ReceiverAuth {
                receiver_id: "rx".into(),
                token: "tok-a".into(),
            }),
        )
        .await;
        assert!(matches!(
            next_envelope(&mut read).await,
            Envelope::AuthFailure(_)
        ));
        assert!(state.registry.connected(PeerRole::Receiver).await.is_empty());
    }

    #[tokio::test]
    async fn first_frame_must_be_auth() {
        let (addr, _state) = start().await;
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (mut write, mut read) = ws.split();

        send(&mut write, Envelope::Heartbeat(Heartbeat::default())).await;
        match next_envelope(&mut read).await {
            Envelope::AuthFailure(f) => assert!(f.reason.contains("auth frame")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
