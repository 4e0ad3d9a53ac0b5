//! WebSocket client shared by the station and receiver workers.
//!
//! One reader task decodes inbound frames into an mpsc queue; one writer
//! task drains the outbound queue into the socket. The auth frame is sent
//! and answered before either task starts.

use crate::core::config::AUTH_HANDSHAKE_TIMEOUT;
use crate::core::protocol::envelope::{AuthSuccess, Envelope};
use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub struct SignalClient {
    tx: mpsc::UnboundedSender<Envelope>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalClient {
    /// Connect to `url`, authenticate with `auth`, and return the client plus
    /// the inbound queue. The queue ends when the socket closes.
    pub async fn connect(url: &str, auth: Envelope) -> Result<(Self, AuthSuccess, mpsc::UnboundedReceiver<Envelope>)> {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("connecting to {url}"))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::text(auth.encode()?))
            .await
            .context("sending auth frame")?;

        let reply = tokio::time::timeout(AUTH_HANDSHAKE_TIMEOUT, async {
            while let Some(frame) = stream.next().await {
                match frame.context("reading auth reply")? {
                    Message::Text(text) => return Envelope::decode(text.as_str()),
                    Message::Close(_) => break,
                    _ => continue,
                }
            }
            Err(anyhow!("connection closed during auth"))
        })
        .await
        .map_err(|_| anyhow!("no auth reply within {}s", AUTH_HANDSHAKE_TIMEOUT.as_secs()))??;

        let identity = match reply {
            Envelope::AuthSuccess(ok) => ok,
            Envelope::AuthFailure(f) => bail!("authentication rejected: {}", f.reason),
            other => bail!("unexpected '{}' frame during auth", other.kind()),
        };
        info!(event = "ws_connected", peer = %identity.peer_id, role = %identity.role, %url, "Connected to server");

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(event = "ws_read_failure", error = %e, "Server socket read failed");
                        break;
                    }
                };
                match Envelope::decode(text.as_str()) {
                    Ok(env) => {
                        if in_tx.send(env).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(event = "ws_bad_frame", error = %e, "Ignoring undecodable frame"),
                }
            }
        });

        let (tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let writer = tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let text = match envelope.encode() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(event = "ws_encode_failure", error = %e, "Dropping unencodable envelope");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    debug!(event = "ws_write_failure", error = %e, "Writer stopped");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        Ok((Self { tx, reader, writer }, identity, in_rx))
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| anyhow!("server connection closed"))
    }

    /// A cloneable handle for tasks that outlive a borrow of the client.
    pub fn sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.tx.clone()
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
