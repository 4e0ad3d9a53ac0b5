//! Receiver worker: create one request and collect every station's file.
//!
//! Results arrive as `data_ready` pushes, with a poll of the results
//! endpoint as a fallback for missed pushes. Each ready station gets its
//! own download task; one station failing never affects the others. The
//! wait ends at the hard timeout, when the grace window opened by the
//! first successful download closes, or once every fanned-out station has
//! been settled.

use crate::core::config::{REQUEST_GRACE_WINDOW, REQUEST_HARD_TIMEOUT, RESULTS_POLL_INTERVAL};
use crate::core::connection::NegotiationEngine;
use crate::core::protocol::api::{CreateRequestBody, StationResult};
use crate::core::protocol::envelope::{DataReady, Envelope, ReceiverAuth};
use crate::core::protocol::{OutgoingSignal, ResponseStatus, TransferMode};
use crate::core::transfer::sanitize_relative_path;
use crate::utils::sos::SignalOfStop;
use crate::workers::api::RelayApi;
use crate::workers::signal_client::SignalClient;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub ws_url: String,
    pub http_url: String,
    pub receiver_id: String,
    pub token: String,
    pub output_dir: PathBuf,
    pub request_type: String,
    pub parameters: Value,
    pub transfer_mode: TransferMode,
}

/// How one station's delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationOutcome {
    Downloaded { path: PathBuf, bytes: u64 },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub request_id: String,
    pub stations: HashMap<String, StationOutcome>,
}

impl RequestSummary {
    pub fn succeeded(&self) -> usize {
        self.stations
            .values()
            .filter(|o| matches!(o, StationOutcome::Downloaded { .. }))
            .count()
    }
}

/// One ready station, from either a push or a poll.
#[derive(Debug, Clone)]
struct ReadyStation {
    station_id: String,
    file_path: Option<String>,
    session_id: Option<String>,
}

impl From<DataReady> for ReadyStation {
    fn from(d: DataReady) -> Self {
        Self {
            station_id: d.station_id,
            file_path: d.file_path,
            session_id: d.session_id,
        }
    }
}

impl From<&StationResult> for ReadyStation {
    fn from(r: &StationResult) -> Self {
        Self {
            station_id: r.station_id.clone(),
            file_path: r.file_path.clone(),
            session_id: r.session_id.clone(),
        }
    }
}

struct Collector {
    api: RelayApi,
    engine: Arc<NegotiationEngine>,
    request_id: String,
    output_dir: PathBuf,
    /// Stations whose download has been started.
    started: HashSet<String>,
    /// Stations that reported an error without ever being ready.
    station_errors: HashMap<String, String>,
    outcomes: HashMap<String, StationOutcome>,
    downloads: JoinSet<(String, StationOutcome)>,
}

pub async fn run(config: ReceiverConfig, sos: SignalOfStop) -> Result<RequestSummary> {
    let api = RelayApi::new(&config.http_url, &config.token)?;
    let auth = Envelope::ReceiverAuth(ReceiverAuth {
        receiver_id: config.receiver_id.clone(),
        token: config.token.clone(),
    });
    // Connect first so no data_ready push is missed.
    let (_client, _identity, mut inbound) = SignalClient::connect(&config.ws_url, auth).await?;

    let (signal_tx, signal_rx) = mpsc::unbounded_channel::<OutgoingSignal>();
    let engine = Arc::new(NegotiationEngine::new(signal_tx)?);
    let forwarder = tokio::spawn(forward_signals(api.clone(), signal_rx));

    let request_id = api
        .create_request(&CreateRequestBody {
            request_type: config.request_type.clone(),
            parameters: config.parameters.clone(),
            transfer_mode: config.transfer_mode,
        })
        .await?;
    info!(event = "request_created", %request_id, mode = config.transfer_mode.as_str(), "Request created");

    let fanout = api.request(&request_id).await?.fanout_count as usize;

    let mut collector = Collector {
        api,
        engine,
        request_id: request_id.clone(),
        output_dir: config.output_dir.join(&request_id),
        started: HashSet::new(),
        station_errors: HashMap::new(),
        outcomes: HashMap::new(),
        downloads: JoinSet::new(),
    };

    let hard_deadline = Instant::now() + REQUEST_HARD_TIMEOUT;
    let mut grace_deadline: Option<Instant> = None;
    let mut push_open = true;
    let mut poll = tokio::time::interval(RESULTS_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if fanout > 0 && collector.settled() >= fanout && collector.downloads.is_empty() {
            debug!(event = "request_settled", %request_id, "Every station settled");
            break;
        }
        let grace = async move {
            match grace_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = sos.wait() => break,
            _ = sleep_until(hard_deadline) => {
                warn!(event = "request_timeout", %request_id, "Hard timeout reached");
                break;
            }
            _ = grace => {
                info!(event = "grace_window_closed", %request_id, "Grace window closed");
                break;
            }
            _ = poll.tick() => collector.poll().await,
            msg = inbound.recv(), if push_open => match msg {
                Some(envelope) => collector.handle_push(envelope).await,
                None => {
                    warn!(event = "push_channel_closed", %request_id, "Push channel closed, relying on polling");
                    push_open = false;
                }
            },
            Some(joined) = collector.downloads.join_next() => {
                let (station_id, outcome) = joined.map_err(|e| anyhow!("download task panicked: {e}"))?;
                if matches!(outcome, StationOutcome::Downloaded { .. }) && grace_deadline.is_none() {
                    grace_deadline = Some(Instant::now() + REQUEST_GRACE_WINDOW);
                }
                collector.outcomes.insert(station_id, outcome);
            }
        }
    }

    collector.downloads.abort_all();
    forwarder.abort();

    let mut stations = collector.outcomes;
    for (station_id, error) in collector.station_errors {
        stations.entry(station_id).or_insert(StationOutcome::Failed(error));
    }
    let summary = RequestSummary { request_id, stations };
    info!(
        event = "request_finished",
        request_id = %summary.request_id,
        succeeded = summary.succeeded(),
        stations = summary.stations.len(),
        "Request finished"
    );
    Ok(summary)
}

async fn forward_signals(api: RelayApi, mut rx: mpsc::UnboundedReceiver<OutgoingSignal>) {
    while let Some(out) = rx.recv().await {
        if let Err(e) = api.signal(&out).await {
            warn!(event = "signal_post_failure", session_id = %out.session_id, kind = out.signal.kind(), error = %format!("{e:#}"), "Could not relay local signal");
        }
    }
}

impl Collector {
    fn settled(&self) -> usize {
        self.outcomes.len() + self.station_errors.len()
    }

    async fn handle_push(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::DataReady(ready) if ready.request_id == self.request_id => {
                self.start(ready.into()).await;
            }
            Envelope::IceOffer(d) | Envelope::IceAnswer(d) => {
                self.engine
                    .resolve_remote_description(&d.session_id, d.session_description)
                    .await;
            }
            Envelope::IceCandidate(c) => {
                if let Err(e) = self.engine.add_remote_candidate(&c.session_id, &c.ice_candidate).await {
                    warn!(event = "ice_candidate_rejected", session_id = %c.session_id, error = %e, "Remote candidate rejected");
                }
            }
            Envelope::SessionDeclined(d) => {
                info!(event = "session_declined", session_id = %d.session_id, "Station side declined the session");
                self.engine.close_session(&d.session_id).await;
            }
            Envelope::Error(e) => warn!(event = "server_error", message = %e.message, "Server reported an error"),
            other => debug!(event = "ws_unexpected", kind = other.kind(), "Ignoring push"),
        }
    }

    async fn poll(&mut self) {
        let results = match self.api.results(&self.request_id).await {
            Ok(r) => r,
            Err(e) => {
                debug!(event = "results_poll_failure", request_id = %self.request_id, error = %format!("{e:#}"), "Results poll failed");
                return;
            }
        };
        for result in &results {
            match result.status {
                ResponseStatus::Ready => self.start(result.into()).await,
                ResponseStatus::Error if !self.started.contains(&result.station_id) => {
                    let error = result.error.clone().unwrap_or_else(|| "station error".into());
                    self.station_errors.insert(result.station_id.clone(), error);
                }
                _ => {}
            }
        }
    }

    /// Start a download for `ready` unless one is already running or done.
    async fn start(&mut self, ready: ReadyStation) {
        if !self.started.insert(ready.station_id.clone()) {
            return;
        }
        self.station_errors.remove(&ready.station_id);

        let station_dir = self.output_dir.join(sanitize_relative_path(&ready.station_id));
        let station_id = ready.station_id.clone();
        info!(
            event = "station_download_started",
            request_id = %self.request_id,
            station_id = %station_id,
            direct = ready.session_id.is_some(),
            "Fetching station file"
        );

        match ready.session_id {
            Some(session_id) => {
                // Register before the station's offer can arrive.
                let offer_rx = self.engine.register_waiter(&session_id).await;
                let engine = self.engine.clone();
                let api = self.api.clone();
                self.downloads.spawn(async move {
                    let backlog = api.candidates(&session_id);
                    let outcome = match engine
                        .answer_and_receive(&session_id, offer_rx, backlog, &station_dir)
                        .await
                    {
                        Ok(path) => {
                            let bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                            StationOutcome::Downloaded { path, bytes }
                        }
                        Err(e) => StationOutcome::Failed(format!("{e:#}")),
                    };
                    let accept = matches!(outcome, StationOutcome::Downloaded { .. });
                    if let Err(e) = api.respond(&session_id, accept).await {
                        debug!(event = "session_respond_failure", %session_id, error = %format!("{e:#}"), "Could not close out the session");
                    }
                    log_outcome(&station_id, &outcome);
                    (station_id, outcome)
                });
            }
            None => {
                let api = self.api.clone();
                let request_id = self.request_id.clone();
                let filename = ready
                    .file_path
                    .as_deref()
                    .and_then(|p| sanitize_relative_path(p).file_name().map(|n| n.to_os_string()))
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("capture"));
                let dest = station_dir.join(filename);
                self.downloads.spawn(async move {
                    let outcome = match api.download(&request_id, &station_id, &dest).await {
                        Ok(bytes) => StationOutcome::Downloaded { path: dest, bytes },
                        Err(e) => StationOutcome::Failed(format!("{e:#}")),
                    };
                    log_outcome(&station_id, &outcome);
                    (station_id, outcome)
                });
            }
        }
    }
}

fn log_outcome(station_id: &str, outcome: &StationOutcome) {
    match outcome {
        StationOutcome::Downloaded { path, bytes } => {
            info!(event = "station_download_done", station_id, path = %path.display(), bytes, "Station file saved");
        }
        StationOutcome::Failed(error) => {
            warn!(event = "station_download_failure", station_id, %error, "Station download failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_only_downloads() {
        let mut stations = HashMap::new();
        stations.insert(
            "A".to_string(),
            StationOutcome::Downloaded {
                path: PathBuf::from("a"),
                bytes: 3,
            },
        );
        stations.insert("B".to_string(), StationOutcome::Failed("boom".into()));
        let summary = RequestSummary {
            request_id: "r".into(),
            stations,
        };
        assert_eq!(summary.succeeded(), 1);
    }

    #[test]
    fn poll_rows_and_pushes_describe_the_same_station() {
        let row = StationResult {
            station_id: "B".into(),
            status: ResponseStatus::Ready,
            file_path: Some("x.pcap".into()),
            file_size: Some(1),
            download_url: None,
            error: None,
            session_id: Some("s".into()),
        };
        let from_row = ReadyStation::from(&row);
        let from_push = ReadyStation::from(DataReady {
            request_id: "r".into(),
            station_id: "B".into(),
            file_path: Some("x.pcap".into()),
            download_url: None,
            file_size: Some(1),
            session_id: Some("s".into()),
        });
        assert_eq!(from_row.station_id, from_push.station_id);
        assert_eq!(from_row.session_id, from_push.session_id);
        assert_eq!(from_row.file_path, from_push.file_path);
    }
}
