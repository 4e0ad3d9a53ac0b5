//! Station side: create the offer and the file channel, then push the file.

use super::initializer::from_rtc_description;
use super::NegotiationEngine;
use crate::core::config::{DATA_CHANNEL_TIMEOUT, DC_CLOSE_GRACE, FILE_CHANNEL_LABEL, SDP_EXCHANGE_TIMEOUT};
use crate::core::protocol::{OutgoingSignal, SdpKind, Signal};
use crate::core::transfer::sender::send_file;
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

impl NegotiationEngine {
    /// Offer a data channel for `session_id` and stream `path` over it once
    /// the receiver answers. Returns the number of payload bytes sent.
    ///
    /// Every exit path closes the session's peer connection.
    pub async fn offer_and_send(&self, session_id: &str, path: &Path, filename: &str) -> Result<u64> {
        let result = self.offer_and_send_inner(session_id, path, filename).await;
        self.close_session(session_id).await;
        result
    }

    async fn offer_and_send_inner(&self, session_id: &str, path: &Path, filename: &str) -> Result<u64> {
        let (pc, failed) = self.new_peer_connection(session_id).await?;

        // Explicit ordered + fully reliable (SCTP default, no partial reliability).
        let dc = pc
            .create_data_channel(
                FILE_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .context("creating file data channel")?;
        let opened = once_callback(&dc, Hook::Open);
        let closed = once_callback(&dc, Hook::Close);

        // The answer may race the offer; the waiter must exist first.
        let answer_rx = self.register_waiter(session_id).await;

        let offer = pc.create_offer(None).await.context("creating offer")?;
        pc.set_local_description(offer.clone())
            .await
            .context("setting local description")?;
        self.emit(OutgoingSignal {
            session_id: session_id.to_string(),
            signal: Signal::Offer(from_rtc_description(SdpKind::Offer, &offer)),
        })?;
        debug!(event = "offer_sent", session_id, "Offer sent, waiting for answer");

        let answer = timeout(SDP_EXCHANGE_TIMEOUT, answer_rx)
            .await
            .map_err(|_| anyhow!("no answer within {}s", SDP_EXCHANGE_TIMEOUT.as_secs()))?
            .map_err(|_| anyhow!("answer waiter replaced"))?;
        self.apply_remote(session_id, &pc, &answer).await?;

        if dc.ready_state() != RTCDataChannelState::Open {
            tokio::select! {
                r = timeout(DATA_CHANNEL_TIMEOUT, opened) => {
                    r.map_err(|_| anyhow!("data channel not open within {}s", DATA_CHANNEL_TIMEOUT.as_secs()))?
                        .map_err(|_| anyhow!("data channel dropped before opening"))?;
                }
                _ = failed.notified() => return Err(anyhow!("peer connection failed before the data channel opened")),
            }
        }

        let sent = send_file(&dc, path, filename).await?;
        info!(event = "direct_transfer_sent", session_id, file = %filename, bytes = sent, "File sent over data channel");

        // The receiver closes once it has counted every byte.
        if timeout(DC_CLOSE_GRACE, closed).await.is_err() {
            debug!(event = "dc_close_grace_expired", session_id, "Receiver did not close the channel in time");
        }
        Ok(sent)
    }
}

enum Hook {
    Open,
    Close,
}

/// One-shot notification for the first `open` or `close` of `dc`.
fn once_callback(dc: &Arc<RTCDataChannel>, hook: Hook) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel::<()>();
    let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
    let fire = move || {
        if let Ok(mut guard) = tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    };
    match hook {
        Hook::Open => dc.on_open(Box::new(move || {
            fire();
            Box::pin(async {})
        })),
        Hook::Close => dc.on_close(Box::new(move || {
            fire();
            Box::pin(async {})
        })),
    }
    rx
}
