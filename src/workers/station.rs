//! Station worker: stay connected, answer data requests, serve direct
//! transfers.
//!
//! The socket is re-established after [`RECONNECT_DELAY`] whenever it drops.
//! Each data request is produced on its own task and reported with a
//! `data_response`; a `new_ice_session` push starts an offer on the
//! [`NegotiationEngine`] for the file produced earlier for that request.

use crate::core::config::RECONNECT_DELAY;
use crate::core::connection::NegotiationEngine;
use crate::core::protocol::envelope::{
    CollectorAuth, DataRequestPush, DataResponse, Envelope, Heartbeat, IceCandidate, IceDescription, NewIceSession,
};
use crate::core::protocol::{OutgoingSignal, ResponseStatus, Signal};
use crate::core::transfer::sanitize_relative_path;
use crate::utils::sos::SignalOfStop;
use crate::workers::signal_client::SignalClient;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct StationConfig {
    pub ws_url: String,
    pub station_id: String,
    pub token: String,
    pub capture_dir: PathBuf,
    pub download_base: Option<Url>,
    pub heartbeat: Duration,
}

/// A file ready to be handed to a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub path: PathBuf,
    /// Name relative to the capture directory, as reported to the server.
    pub filename: String,
    pub size: u64,
    pub download_url: Option<String>,
}

/// Turns a data request into a file on disk.
pub trait CaptureProducer: Send + Sync + 'static {
    fn produce(&self, request: &DataRequestPush) -> impl Future<Output = Result<Capture>> + Send;
}

/// Serves existing files from a directory. The request names the file in
/// `parameters.file` (or `parameters.filename`).
#[derive(Debug, Clone)]
pub struct DirectoryProducer {
    dir: PathBuf,
    download_base: Option<Url>,
}

impl DirectoryProducer {
    pub fn new(dir: impl Into<PathBuf>, download_base: Option<Url>) -> Self {
        Self {
            dir: dir.into(),
            download_base,
        }
    }

    fn resolve(&self, requested: &str) -> (PathBuf, String) {
        let relative = sanitize_relative_path(requested);
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        (self.dir.join(&relative), name)
    }
}

impl CaptureProducer for DirectoryProducer {
    async fn produce(&self, request: &DataRequestPush) -> Result<Capture> {
        let requested = request
            .parameters
            .get("file")
            .or_else(|| request.parameters.get("filename"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("request has no 'file' parameter"))?;
        let (path, filename) = self.resolve(requested);

        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("capture '{filename}' not found"))?;
        if !meta.is_file() {
            bail!("capture '{filename}' is not a file");
        }
        let download_url = match &self.download_base {
            Some(base) => Some(base.join(&filename).context("building download URL")?.to_string()),
            None => None,
        };
        Ok(Capture {
            path,
            filename,
            size: meta.len(),
            download_url,
        })
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

/// Connect, serve, reconnect until `sos` fires.
pub async fn run<P: CaptureProducer>(config: StationConfig, producer: Arc<P>, sos: SignalOfStop) -> Result<()> {
    info!(event = "station_started", station_id = %config.station_id, url = %config.ws_url, "Station starting");
    loop {
        match serve_once(&config, producer.clone(), &sos).await {
            Ok(()) if sos.cancelled() => return Ok(()),
            Ok(()) => warn!(event = "station_disconnected", "Server connection closed"),
            Err(e) => warn!(event = "station_connection_failure", error = %format!("{e:#}"), "Server connection failed"),
        }
        if !sos.sleep(RECONNECT_DELAY).await {
            return Ok(());
        }
        info!(event = "station_reconnecting", "Reconnecting");
    }
}

struct StationCtx<P> {
    station_id: String,
    producer: Arc<P>,
    engine: Arc<NegotiationEngine>,
    outbound: mpsc::UnboundedSender<Envelope>,
    captures: Mutex<HashMap<String, Capture>>,
}

async fn serve_once<P: CaptureProducer>(config: &StationConfig, producer: Arc<P>, sos: &SignalOfStop) -> Result<()> {
    let auth = Envelope::CollectorAuth(CollectorAuth {
        station_id: config.station_id.clone(),
        token: config.token.clone(),
    });
    let (client, _identity, mut inbound) = SignalClient::connect(&config.ws_url, auth).await?;

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<OutgoingSignal>();
    let ctx = Arc::new(StationCtx {
        station_id: config.station_id.clone(),
        producer,
        engine: Arc::new(NegotiationEngine::new(signal_tx)?),
        outbound: client.sender(),
        captures: Mutex::new(HashMap::new()),
    });

    let mut heartbeat = tokio::time::interval(config.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = sos.wait() => return Ok(()),
            _ = heartbeat.tick() => {
                client.send(Envelope::Heartbeat(Heartbeat {
                    timestamp: Some(crate::core::store::now_unix() as u64),
                }))?;
            }
            Some(out) = signal_rx.recv() => client.send(signal_envelope(out))?,
            msg = inbound.recv() => match msg {
                Some(envelope) => handle_push(&ctx, envelope).await,
                None => return Ok(()),
            },
        }
    }
}

/// Stations always speak offers and candidates.
fn signal_envelope(out: OutgoingSignal) -> Envelope {
    match out.signal {
        Signal::Offer(desc) | Signal::Answer(desc) => Envelope::IceOffer(IceDescription {
            session_id: out.session_id,
            session_description: desc,
        }),
        Signal::Candidate(candidate) => Envelope::IceCandidate(IceCandidate {
            session_id: out.session_id,
            ice_candidate: candidate,
        }),
    }
}

async fn handle_push<P: CaptureProducer>(ctx: &Arc<StationCtx<P>>, envelope: Envelope) {
    match envelope {
        Envelope::DataRequest(request) => {
            let ctx = ctx.clone();
            tokio::spawn(async move { produce_and_report(&ctx, request).await });
        }
        Envelope::NewIceSession(session) => {
            let ctx = ctx.clone();
            tokio::spawn(async move { serve_direct(&ctx, session).await });
        }
        Envelope::IceAnswer(d) | Envelope::IceOffer(d) => {
            ctx.engine
                .resolve_remote_description(&d.session_id, d.session_description)
                .await;
        }
        Envelope::IceCandidate(c) => {
            if let Err(e) = ctx.engine.add_remote_candidate(&c.session_id, &c.ice_candidate).await {
                warn!(event = "ice_candidate_rejected", session_id = %c.session_id, error = %e, "Remote candidate rejected");
            }
        }
        Envelope::SessionDeclined(d) => {
            let live = ctx.engine.has_session(&d.session_id).await;
            info!(event = "session_declined", session_id = %d.session_id, live, "Receiver declined the session");
            ctx.engine.close_session(&d.session_id).await;
        }
        Envelope::HeartbeatResponse(_) => debug!(event = "heartbeat_ack", "Heartbeat acknowledged"),
        Envelope::Error(e) => warn!(event = "server_error", message = %e.message, "Server reported an error"),
        other => debug!(event = "ws_unexpected", kind = other.kind(), "Ignoring unexpected push"),
    }
}

async fn produce_and_report<P: CaptureProducer>(ctx: &StationCtx<P>, request: DataRequestPush) {
    info!(
        event = "data_request",
        request_id = %request.request_id,
        request_type = %request.request_type,
        "Producing data"
    );
    let response = match ctx.producer.produce(&request).await {
        Ok(capture) => {
            let response = DataResponse {
                request_id: request.request_id.clone(),
                status: ResponseStatus::Ready,
                file_path: Some(capture.filename.clone()),
                download_url: capture.download_url.clone(),
                file_size: Some(capture.size),
                error: None,
                station_id: ctx.station_id.clone(),
            };
            ctx.captures
                .lock()
                .await
                .insert(request.request_id.clone(), capture);
            response
        }
        Err(e) => {
            warn!(event = "produce_failure", request_id = %request.request_id, error = %format!("{e:#}"), "Could not produce data");
            DataResponse {
                request_id: request.request_id.clone(),
                status: ResponseStatus::Error,
                file_path: None,
                download_url: None,
                file_size: None,
                error: Some(format!("{e:#}")),
                station_id: ctx.station_id.clone(),
            }
        }
    };
    if ctx.outbound.send(Envelope::DataResponse(response)).is_err() {
        error!(event = "report_failure", request_id = %request.request_id, "Connection closed before the response was sent");
    }
}

async fn serve_direct<P: CaptureProducer>(ctx: &StationCtx<P>, session: NewIceSession) {
    let capture = ctx.captures.lock().await.get(&session.request_id).cloned();
    let Some(capture) = capture else {
        warn!(event = "direct_unknown_request", request_id = %session.request_id, session_id = %session.session_id, "No capture for this session");
        return;
    };
    match ctx
        .engine
        .offer_and_send(&session.session_id, &capture.path, file_name(&capture))
        .await
    {
        Ok(bytes) => info!(event = "direct_transfer_done", session_id = %session.session_id, bytes, "Direct transfer finished"),
        Err(e) => warn!(event = "direct_transfer_failure", session_id = %session.session_id, error = %format!("{e:#}"), "Direct transfer aborted"),
    }
}

fn file_name(capture: &Capture) -> &str {
    Path::new(&capture.filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&capture.filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("capture_relay_station_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn request(params: serde_json::Value) -> DataRequestPush {
        DataRequestPush {
            request_id: "r1".into(),
            request_type: "pcap".into(),
            parameters: params,
        }
    }

    #[tokio::test]
    async fn directory_producer_resolves_inside_capture_dir() {
        let dir = temp_dir("produce");
        std::fs::create_dir_all(dir.join("day1")).unwrap();
        std::fs::write(dir.join("day1/a.pcap"), vec![7u8; 42]).unwrap();
        let base = Url::parse("http://station.local:9000/files/").unwrap();
        let producer = DirectoryProducer::new(&dir, Some(base));

        let capture = producer.produce(&request(json!({"file": "day1/a.pcap"}))).await.unwrap();
        assert_eq!(capture.size, 42);
        assert_eq!(capture.filename, "day1/a.pcap");
        assert_eq!(capture.download_url.as_deref(), Some("http://station.local:9000/files/day1/a.pcap"));
        assert_eq!(file_name(&capture), "a.pcap");

        // Traversal collapses to a name inside the directory, which is missing.
        assert!(producer.produce(&request(json!({"file": "../../etc/passwd"}))).await.is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_parameter_is_an_error() {
        let dir = temp_dir("noparam");
        let producer = DirectoryProducer::new(&dir, None);
        let err = producer.produce(&request(json!({}))).await.unwrap_err();
        assert!(err.to_string().contains("'file'"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn local_signals_map_to_station_envelopes() {
        let env = signal_envelope(OutgoingSignal {
            session_id: "s".into(),
            signal: Signal::Candidate(crate::core::protocol::IceCandidatePayload {
                candidate: "candidate:1".into(),
                sdp_mid: None,
                sdp_mline_index: None,
            }),
        });
        assert_eq!(env.kind(), "ice_candidate");
    }
}
