//! Receiver side: answer the station's offer and collect the file.

use super::initializer::from_rtc_description;
use super::NegotiationEngine;
use crate::core::config::{DATA_CHANNEL_TIMEOUT, FILE_CHANNEL_LABEL, SDP_EXCHANGE_TIMEOUT};
use crate::core::protocol::{IceCandidatePayload, OutgoingSignal, SdpKind, SessionDescription, Signal};
use crate::core::transfer::receiver::{receive, ChannelEvent};
use anyhow::{anyhow, bail, Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

impl NegotiationEngine {
    /// Wait for the station's offer on `offer_rx`, answer it, and write the
    /// transferred file into `dest_dir`.
    ///
    /// `backlog` yields candidates the station trickled before this side had
    /// a peer connection; it is polled right after the answer goes out.
    pub async fn answer_and_receive<F>(
        &self,
        session_id: &str,
        offer_rx: oneshot::Receiver<SessionDescription>,
        backlog: F,
        dest_dir: &Path,
    ) -> Result<PathBuf>
    where
        F: Future<Output = Result<Vec<IceCandidatePayload>>>,
    {
        let result = self
            .answer_and_receive_inner(session_id, offer_rx, backlog, dest_dir)
            .await;
        self.close_session(session_id).await;
        result
    }

    async fn answer_and_receive_inner<F>(
        &self,
        session_id: &str,
        offer_rx: oneshot::Receiver<SessionDescription>,
        backlog: F,
        dest_dir: &Path,
    ) -> Result<PathBuf>
    where
        F: Future<Output = Result<Vec<IceCandidatePayload>>>,
    {
        let offer = timeout(SDP_EXCHANGE_TIMEOUT, offer_rx)
            .await
            .map_err(|_| anyhow!("no offer within {}s", SDP_EXCHANGE_TIMEOUT.as_secs()))?
            .map_err(|_| anyhow!("offer waiter replaced"))?;
        if offer.kind != SdpKind::Offer {
            bail!("expected an offer, got an answer");
        }

        let (pc, failed) = self.new_peer_connection(session_id).await?;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let (dc_tx, dc_rx) = oneshot::channel::<Arc<RTCDataChannel>>();
        let dc_tx = Arc::new(std::sync::Mutex::new(Some(dc_tx)));

        let sid = session_id.to_string();
        let events = events_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = events.clone();
            let dc_tx = dc_tx.clone();
            let sid = sid.clone();
            Box::pin(async move {
                if dc.label() != FILE_CHANNEL_LABEL {
                    warn!(event = "dc_unexpected_label", session_id = %sid, label = %dc.label(), "Ignoring unexpected data channel");
                    return;
                }
                attach_event_handlers(&dc, events);
                if let Ok(mut guard) = dc_tx.lock() {
                    if let Some(tx) = guard.take() {
                        let _ = tx.send(dc);
                    }
                }
            })
        }));

        self.apply_remote(session_id, &pc, &offer).await?;
        let answer = pc.create_answer(None).await.context("creating answer")?;
        pc.set_local_description(answer.clone())
            .await
            .context("setting local description")?;
        self.emit(OutgoingSignal {
            session_id: session_id.to_string(),
            signal: Signal::Answer(from_rtc_description(SdpKind::Answer, &answer)),
        })?;
        debug!(event = "answer_sent", session_id, "Answer sent");

        match backlog.await {
            Ok(candidates) => {
                for candidate in &candidates {
                    if let Err(e) = self.add_remote_candidate(session_id, candidate).await {
                        warn!(event = "ice_candidate_rejected", session_id, error = %e, "Backlog candidate rejected");
                    }
                }
            }
            Err(e) => warn!(event = "ice_backlog_failure", session_id, error = %e, "Could not fetch candidate backlog"),
        }

        let _dc = tokio::select! {
            r = timeout(DATA_CHANNEL_TIMEOUT, dc_rx) => {
                r.map_err(|_| anyhow!("data channel not open within {}s", DATA_CHANNEL_TIMEOUT.as_secs()))?
                    .map_err(|_| anyhow!("peer connection dropped before the data channel arrived"))?
            }
            _ = failed.notified() => return Err(anyhow!("peer connection failed before the data channel opened")),
        };

        // A failed connection may never fire the channel's close callback.
        let watchdog = tokio::spawn(async move {
            failed.notified().await;
            let _ = events_tx.send(ChannelEvent::Closed);
        });
        let result = receive(&mut events_rx, dest_dir).await;
        watchdog.abort();
        result
    }
}

fn attach_event_handlers(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<ChannelEvent>) {
    let on_msg = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let event = if msg.is_string {
            ChannelEvent::Text(String::from_utf8_lossy(&msg.data).into_owned())
        } else {
            ChannelEvent::Binary(msg.data)
        };
        let _ = on_msg.send(event);
        Box::pin(async {})
    }));
    dc.on_close(Box::new(move || {
        let _ = events.send(ChannelEvent::Closed);
        Box::pin(async {})
    }));
}
