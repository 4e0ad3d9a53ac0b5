//! Peer connection construction and SDP/candidate conversions.

use crate::core::config::STUN_SERVERS;
use crate::core::protocol::{IceCandidatePayload, OutgoingSignal, SdpKind, SessionDescription, Signal};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

pub(crate) fn create_webrtc_api() -> Result<API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;
    Ok(APIBuilder::new()
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

/// STUN only. Peers behind symmetric NATs will not connect.
pub(crate) fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }]
}

/// Build a peer connection for `session_id` that trickles its local
/// candidates into `signal_tx` and raises `failed` when ICE gives up.
pub(crate) async fn build_peer_connection(
    api: &API,
    session_id: &str,
    signal_tx: mpsc::UnboundedSender<OutgoingSignal>,
) -> Result<(Arc<RTCPeerConnection>, Arc<Notify>)> {
    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers: default_ice_servers(),
            ..Default::default()
        })
        .await
        .context("creating peer connection")?,
    );

    let sid = session_id.to_string();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let signal_tx = signal_tx.clone();
        let sid = sid.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(c) = candidate else { return };
            let init = match c.to_json() {
                Ok(init) => init,
                Err(e) => {
                    error!(event = "ice_candidate_encode_failure", session_id = %sid, error = %e, "Failed to serialize local candidate");
                    return;
                }
            };
            let signal = OutgoingSignal {
                session_id: sid.clone(),
                signal: Signal::Candidate(candidate_payload(init)),
            };
            if signal_tx.send(signal).is_err() {
                debug!(event = "ice_candidate_dropped", session_id = %sid, "Signal sink closed, local candidate dropped");
            }
        })
    }));

    let failed = Arc::new(Notify::new());
    let failed_cb = failed.clone();
    let sid = session_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let failed = failed_cb.clone();
        let sid = sid.clone();
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", session_id = %sid, "Peer connection established");
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(event = "webrtc_disconnected", session_id = %sid, "Transient disconnect (ICE may recover)");
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", session_id = %sid, "Peer connection failed");
                    failed.notify_one();
                }
                RTCPeerConnectionState::Closed => {
                    debug!(event = "webrtc_closed", session_id = %sid, "Peer connection closed");
                }
                _ => {}
            }
        })
    }));

    Ok((pc, failed))
}

// ── Conversions ──────────────────────────────────────────────────────────────

pub(crate) fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = desc.sdp.clone();
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    };
    rtc.context("invalid session description")
}

pub(crate) fn from_rtc_description(kind: SdpKind, desc: &RTCSessionDescription) -> SessionDescription {
    SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    }
}

pub(crate) fn candidate_init(payload: &IceCandidatePayload) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: payload.candidate.clone(),
        sdp_mid: payload.sdp_mid.clone(),
        sdp_mline_index: payload.sdp_mline_index,
        ..Default::default()
    }
}

pub(crate) fn candidate_payload(init: RTCIceCandidateInit) -> IceCandidatePayload {
    IceCandidatePayload {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_are_stun_only() {
        let servers = default_ice_servers();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].urls.iter().all(|u| u.starts_with("stun:")));
        assert!(servers[0].username.is_empty());
    }

    #[test]
    fn candidate_conversion_keeps_mid_and_index() {
        let payload = IceCandidatePayload {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let init = candidate_init(&payload);
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate_payload(init), payload);
    }

    #[test]
    fn description_kind_follows_payload() {
        let desc = SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".into(),
        };
        let rtc = to_rtc_description(&desc).unwrap();
        assert_eq!(from_rtc_description(SdpKind::Answer, &rtc), desc);
    }
}
