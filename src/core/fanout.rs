//! Request fan-out and response aggregation.
//!
//! A receiver's request is pushed to up to [`MAX_FANOUT_STATIONS`] fresh
//! stations. Each station answers independently with `data_response`; every
//! answer lands in its own (request, station) slot. The first ready station
//! is mirrored onto the request row for single-result consumers, and every
//! ready transition is pushed to the receiver as `data_ready`.
//!
//! In `direct` mode a ready response also opens an ICE session (receiver as
//! initiator, station as target) so the two can negotiate a data channel.

use crate::core::config::{MAX_FANOUT_STATIONS, STATION_FRESHNESS_WINDOW};
use crate::core::error::{RelayError, RelayResult};
use crate::core::protocol::api::{CreateRequestBody, RequestView, StationResult};
use crate::core::protocol::envelope::{DataReady, DataRequestPush, DataResponse, Envelope, NewIceSession};
use crate::core::protocol::{PeerKey, PeerRole, ResponseStatus, TransferMode};
use crate::core::registry::Registry;
use crate::core::signaling::SignalingRelay;
use crate::core::store::requests::{self, MirrorUpdate, NewRequest, RequestRecord, RequestStatus};
use crate::core::store::responses::{self, ResponseUpsert};
use crate::core::store::stations::{self, StationRecord};
use crate::core::store::{self, Db};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Ranking ──────────────────────────────────────────────────────────────────

/// Orders fresh stations; the fan-out takes the head of the list.
pub trait StationRanker: Send + Sync {
    fn rank(&self, candidates: Vec<StationRecord>) -> Vec<StationRecord>;
}

/// Most recent heartbeat first, station id as tie-breaker.
#[derive(Debug, Default, Clone, Copy)]
pub struct FreshestFirst;

impl StationRanker for FreshestFirst {
    fn rank(&self, mut candidates: Vec<StationRecord>) -> Vec<StationRecord> {
        candidates.sort_by(|a, b| {
            b.last_heartbeat
                .cmp(&a.last_heartbeat)
                .then_with(|| a.station_id.cmp(&b.station_id))
        });
        candidates
    }
}

// ── Fan-out ──────────────────────────────────────────────────────────────────

pub struct RequestFanout {
    db: Db,
    registry: Arc<Registry>,
    relay: Arc<SignalingRelay>,
    ranker: Box<dyn StationRanker>,
}

impl RequestFanout {
    pub fn new(db: Db, registry: Arc<Registry>, relay: Arc<SignalingRelay>) -> Self {
        Self::with_ranker(db, registry, relay, Box::new(FreshestFirst))
    }

    pub fn with_ranker(
        db: Db,
        registry: Arc<Registry>,
        relay: Arc<SignalingRelay>,
        ranker: Box<dyn StationRanker>,
    ) -> Self {
        Self {
            db,
            registry,
            relay,
            ranker,
        }
    }

    /// Persist a new request and push it to the selected stations.
    ///
    /// Fails with `Unavailable` when no station is fresh or none accepted
    /// delivery; the request row is left in `error` in that case.
    pub async fn create_request(&self, requester: &PeerKey, body: CreateRequestBody) -> RelayResult<String> {
        if requester.role != PeerRole::Receiver {
            return Err(RelayError::Authorization(
                "only receivers can create data requests".into(),
            ));
        }
        if body.request_type.trim().is_empty() {
            return Err(RelayError::Validation("request_type is required".into()));
        }

        let request_id = Uuid::new_v4().to_string();
        let now = store::now_unix();
        let selected = {
            let conn = store::lock(&self.db);
            requests::insert_request(
                &conn,
                &NewRequest {
                    request_id: &request_id,
                    request_type: &body.request_type,
                    parameters: &body.parameters,
                    requester_id: &requester.id,
                    transfer_mode: body.transfer_mode,
                    created_at: now,
                },
            )?;
            let since = now - STATION_FRESHNESS_WINDOW.as_secs() as i64;
            let mut ranked = self.ranker.rank(stations::fresh_stations(&conn, since)?);
            ranked.truncate(MAX_FANOUT_STATIONS);
            // Replies can be handled before the pushes below finish, so the
            // selection must already be on the row.
            if let Some(first) = ranked.first() {
                requests::mark_assigned(&conn, &request_id, &first.station_id, ranked.len() as u32)?;
            }
            ranked
        };

        if selected.is_empty() {
            return self.fail_request(&request_id, "no fresh stations");
        }

        let mut delivered: Vec<String> = Vec::with_capacity(selected.len());
        for station in &selected {
            let push = Envelope::DataRequest(DataRequestPush {
                request_id: request_id.clone(),
                request_type: body.request_type.clone(),
                parameters: body.parameters.clone(),
            });
            if self.registry.push(&PeerKey::station(&station.station_id), push).await {
                delivered.push(station.station_id.clone());
            } else {
                warn!(
                    event = "fanout_station_unreachable",
                    request_id = %request_id,
                    station_id = %station.station_id,
                    "Fresh station has no live connection, skipping"
                );
            }
        }

        let Some(first) = delivered.first() else {
            return self.fail_request(&request_id, "no station accepted delivery");
        };

        if delivered.len() < selected.len() {
            self.settle_fanout(&request_id, first, delivered.len() as u32)?;
        }

        info!(
            event = "request_fanned_out",
            request_id = %request_id,
            request_type = %body.request_type,
            mode = body.transfer_mode.as_str(),
            stations = ?delivered,
            "Data request pushed to stations"
        );
        Ok(request_id)
    }

    /// Shrink the recorded fan-out to the stations that accepted delivery.
    /// Errors that arrived while the count was still the selection size are
    /// re-checked against the corrected count.
    fn settle_fanout(&self, request_id: &str, first: &str, delivered: u32) -> RelayResult<()> {
        let conn = store::lock(&self.db);
        requests::set_fanout(&conn, request_id, first, delivered)?;
        if fail_if_all_errored(&conn, request_id, delivered)? {
            warn!(event = "request_failed", request_id, stations = delivered, "Every station reported an error");
        }
        Ok(())
    }

    fn fail_request(&self, request_id: &str, reason: &str) -> RelayResult<String> {
        {
            let conn = store::lock(&self.db);
            requests::set_status(&conn, request_id, RequestStatus::Error)?;
        }
        warn!(event = "request_unavailable", request_id, reason, "No collectors available");
        Err(RelayError::Unavailable("no collectors available".into()))
    }

    /// Record one station's outcome and notify the receiver on a ready transition.
    pub async fn handle_response(&self, station: &PeerKey, resp: DataResponse) -> RelayResult<()> {
        if station.role != PeerRole::Station || resp.station_id != station.id {
            return Err(RelayError::Authorization(format!(
                "{station} cannot report for station '{}'",
                resp.station_id
            )));
        }
        if resp.status == ResponseStatus::Ready && resp.file_path.is_none() && resp.download_url.is_none() {
            return Err(RelayError::Validation(
                "ready response needs a file_path or download_url".into(),
            ));
        }

        let (request, previous) = {
            let conn = store::lock(&self.db);
            let request = load_request(&conn, &resp.request_id)?;
            let previous = responses::upsert_response(
                &conn,
                &ResponseUpsert {
                    request_id: &resp.request_id,
                    station_id: &resp.station_id,
                    status: resp.status,
                    file_path: resp.file_path.as_deref(),
                    download_url: resp.download_url.as_deref(),
                    file_size: resp.file_size,
                    error: resp.error.as_deref(),
                    updated_at: store::now_unix(),
                },
            )?;
            (request, previous)
        };

        debug!(
            event = "station_response",
            request_id = %resp.request_id,
            station_id = %resp.station_id,
            status = resp.status.as_str(),
            "Station response recorded"
        );

        match resp.status {
            ResponseStatus::Ready if previous != Some(ResponseStatus::Ready) => {
                self.on_ready(&request, &resp).await
            }
            ResponseStatus::Error => self.on_error(&request, &resp),
            _ => Ok(()),
        }
    }

    async fn on_ready(&self, request: &RequestRecord, resp: &DataResponse) -> RelayResult<()> {
        let receiver = PeerKey::receiver(&request.requester_id);

        let session_id = if request.transfer_mode == TransferMode::Direct {
            let session = self
                .relay
                .create_session(Some(&request.request_id), receiver.clone(), PeerRole::Station)?;
            Some(session.session_id)
        } else {
            None
        };

        let won_mirror = {
            let conn = store::lock(&self.db);
            if let Some(sid) = &session_id {
                responses::set_session(&conn, &request.request_id, &resp.station_id, sid)?;
            }
            requests::mirror_first_ready(
                &conn,
                &request.request_id,
                &MirrorUpdate {
                    station_id: &resp.station_id,
                    file_path: resp.file_path.as_deref(),
                    download_url: resp.download_url.as_deref(),
                    file_size: resp.file_size,
                    status: match request.transfer_mode {
                        TransferMode::Direct => RequestStatus::IceSessionCreated,
                        TransferMode::Proxy => RequestStatus::Ready,
                    },
                },
            )?
        };

        info!(
            event = "station_ready",
            request_id = %request.request_id,
            station_id = %resp.station_id,
            first = won_mirror,
            session_id = ?session_id,
            "Station result ready"
        );

        self.registry
            .push(
                &receiver,
                Envelope::DataReady(DataReady {
                    request_id: request.request_id.clone(),
                    station_id: resp.station_id.clone(),
                    file_path: resp.file_path.clone(),
                    download_url: resp.download_url.clone(),
                    file_size: resp.file_size,
                    session_id: session_id.clone(),
                }),
            )
            .await;

        if let Some(session_id) = session_id {
            self.registry
                .push(
                    &PeerKey::station(&resp.station_id),
                    Envelope::NewIceSession(NewIceSession {
                        session_id,
                        request_id: request.request_id.clone(),
                        file_path: resp.file_path.clone(),
                        file_size: resp.file_size,
                    }),
                )
                .await;
        }
        Ok(())
    }

    fn on_error(&self, request: &RequestRecord, resp: &DataResponse) -> RelayResult<()> {
        warn!(
            event = "station_error",
            request_id = %request.request_id,
            station_id = %resp.station_id,
            error = resp.error.as_deref().unwrap_or("unspecified"),
            "Station failed to produce data"
        );
        let conn = store::lock(&self.db);
        // Re-read the count; the fan-out may have been corrected since `request` was loaded.
        let fanout_count = load_request(&conn, &request.request_id)?.fanout_count;
        if fail_if_all_errored(&conn, &request.request_id, fanout_count)? {
            warn!(
                event = "request_failed",
                request_id = %request.request_id,
                stations = fanout_count,
                "Every station reported an error"
            );
        }
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn request(&self, caller: &PeerKey, request_id: &str) -> RelayResult<RequestView> {
        let conn = store::lock(&self.db);
        let req = load_owned_request(&conn, caller, request_id)?;
        Ok(RequestView {
            request_id: req.request_id,
            request_type: req.request_type,
            status: req.status.as_str().to_string(),
            transfer_mode: req.transfer_mode,
            fanout_count: req.fanout_count,
            assigned_station: req.assigned_station,
            station_id: req.mirror_station,
            file_path: req.mirror_file_path,
            file_size: req.mirror_file_size,
            download_url: req.mirror_download_url,
            created_at: req.created_at.max(0) as u64,
        })
    }

    /// Every station's slot for a request.
    pub fn results(&self, caller: &PeerKey, request_id: &str) -> RelayResult<Vec<StationResult>> {
        let conn = store::lock(&self.db);
        load_owned_request(&conn, caller, request_id)?;
        Ok(responses::list_results(&conn, request_id)?)
    }

    /// The URL the proxy should stream for one station's result.
    pub fn download_target(&self, caller: &PeerKey, request_id: &str, station_id: &str) -> RelayResult<String> {
        let conn = store::lock(&self.db);
        load_owned_request(&conn, caller, request_id)?;
        let result = responses::get_result(&conn, request_id, station_id)?.ok_or_else(|| {
            RelayError::NotFound(format!("no result from station {station_id}"))
        })?;
        if result.status != ResponseStatus::Ready {
            return Err(RelayError::Unavailable(format!(
                "station {station_id} result is {}",
                result.status.as_str()
            )));
        }
        result.download_url.ok_or_else(|| {
            RelayError::Unavailable(format!("station {station_id} did not advertise a download url"))
        })
    }
}

/// Move the request to `error` when every fanned-out station reported one.
fn fail_if_all_errored(conn: &rusqlite::Connection, request_id: &str, fanout_count: u32) -> RelayResult<bool> {
    if fanout_count == 0 {
        return Ok(false);
    }
    let failed = responses::count_by_status(conn, request_id, ResponseStatus::Error)?;
    Ok(failed >= fanout_count && requests::mark_error_if_unresolved(conn, request_id)?)
}

fn load_request(conn: &rusqlite::Connection, request_id: &str) -> RelayResult<RequestRecord> {
    requests::get_request(conn, request_id)?
        .ok_or_else(|| RelayError::NotFound(format!("request {request_id}")))
}

fn load_owned_request(
    conn: &rusqlite::Connection,
    caller: &PeerKey,
    request_id: &str,
) -> RelayResult<RequestRecord> {
    let req = load_request(conn, request_id)?;
    if caller.role != PeerRole::Receiver || caller.id != req.requester_id {
        return Err(RelayError::Authorization(format!(
            "{caller} does not own request {request_id}"
        )));
    }
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::PeerHandle;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Harness {
        fanout: RequestFanout,
        registry: Arc<Registry>,
        db: Db,
    }

    fn harness() -> Harness {
        let db = store::open_in_memory().unwrap();
        let registry = Arc::new(Registry::new(db.clone()));
        let relay = Arc::new(SignalingRelay::new(db.clone(), registry.clone()));
        Harness {
            fanout: RequestFanout::new(db.clone(), registry.clone(), relay),
            registry,
            db,
        }
    }

    async fn connect(h: &Harness, key: PeerKey) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        h.registry.register(key, PeerHandle::new(tx)).await.unwrap();
        rx
    }

    fn body(mode: TransferMode) -> CreateRequestBody {
        CreateRequestBody {
            request_type: "pcap".into(),
            parameters: json!({"interface": "eth0"}),
            transfer_mode: mode,
        }
    }

    fn ready(request_id: &str, station: &str) -> DataResponse {
        DataResponse {
            request_id: request_id.into(),
            status: ResponseStatus::Ready,
            file_path: Some(format!("/captures/{station}.pcap")),
            download_url: Some(format!("http://{station}.local/{station}.pcap")),
            file_size: Some(1024),
            error: None,
            station_id: station.into(),
        }
    }

    fn failed(request_id: &str, station: &str) -> DataResponse {
        DataResponse {
            status: ResponseStatus::Error,
            file_path: None,
            download_url: None,
            file_size: None,
            error: Some("capture failed".into()),
            ..ready(request_id, station)
        }
    }

    #[tokio::test]
    async fn no_fresh_stations_is_unavailable() {
        let h = harness();
        let rx = PeerKey::receiver("rx");
        let err = h.fanout.create_request(&rx, body(TransferMode::Proxy)).await.unwrap_err();
        match err {
            RelayError::Unavailable(msg) => assert_eq!(msg, "no collectors available"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_but_unreachable_stations_are_unavailable() {
        let h = harness();
        {
            let conn = store::lock(&h.db);
            stations::mark_connected(&conn, "ghost", store::now_unix()).unwrap();
        }
        let err = h
            .fanout
            .create_request(&PeerKey::receiver("rx"), body(TransferMode::Proxy))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unavailable(_)));
    }

    #[tokio::test]
    async fn fanout_caps_at_three_and_aggregates_in_order() {
        let h = harness();
        let rx_key = PeerKey::receiver("rx");
        let mut rx = connect(&h, rx_key.clone()).await;
        let mut stations_rx = Vec::new();
        for id in ["A", "B", "C", "D"] {
            stations_rx.push(connect(&h, PeerKey::station(id)).await);
        }

        let request_id = h.fanout.create_request(&rx_key, body(TransferMode::Proxy)).await.unwrap();
        let view = h.fanout.request(&rx_key, &request_id).unwrap();
        assert_eq!(view.fanout_count, 3);
        assert_eq!(view.status, "assigned");

        let pushed = stations_rx
            .iter_mut()
            .map(|r| r.try_recv())
            .filter(|msg| matches!(msg, Ok(Envelope::DataRequest(_))))
            .count();
        assert_eq!(pushed, 3);

        for id in ["B", "A", "C"] {
            h.fanout.handle_response(&PeerKey::station(id), ready(&request_id, id)).await.unwrap();
        }
        // Replaying B's ready neither duplicates its row nor re-notifies.
        h.fanout.handle_response(&PeerKey::station("B"), ready(&request_id, "B")).await.unwrap();

        let results = h.fanout.results(&rx_key, &request_id).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status == ResponseStatus::Ready));

        let view = h.fanout.request(&rx_key, &request_id).unwrap();
        assert_eq!(view.station_id.as_deref(), Some("B"));
        assert_eq!(view.status, "ready");

        let mut notified = Vec::new();
        while let Ok(Envelope::DataReady(ready)) = rx.try_recv() {
            notified.push(ready.station_id);
        }
        assert_eq!(notified, vec!["B", "A", "C"]);
    }

    #[tokio::test]
    async fn direct_mode_opens_a_session_per_ready_station() {
        let h = harness();
        let rx_key = PeerKey::receiver("rx");
        let mut rx = connect(&h, rx_key.clone()).await;
        let mut st = connect(&h, PeerKey::station("A")).await;

        let request_id = h.fanout.create_request(&rx_key, body(TransferMode::Direct)).await.unwrap();
        assert!(matches!(st.recv().await, Some(Envelope::DataRequest(_))));

        h.fanout.handle_response(&PeerKey::station("A"), ready(&request_id, "A")).await.unwrap();

        let Some(Envelope::DataReady(ready)) = rx.recv().await else {
            panic!("expected data_ready");
        };
        let Some(Envelope::NewIceSession(session)) = st.recv().await else {
            panic!("expected new_ice_session");
        };
        assert_eq!(ready.session_id.as_deref(), Some(session.session_id.as_str()));

        let results = h.fanout.results(&rx_key, &request_id).unwrap();
        assert_eq!(results[0].session_id.as_deref(), Some(session.session_id.as_str()));
        let view = h.fanout.request(&rx_key, &request_id).unwrap();
        assert_eq!(view.status, "ice_session_created");
    }

    #[tokio::test]
    async fn all_stations_failing_marks_request_error() {
        let h = harness();
        let rx_key = PeerKey::receiver("rx");
        let _a = connect(&h, PeerKey::station("A")).await;
        let _b = connect(&h, PeerKey::station("B")).await;
        let request_id = h.fanout.create_request(&rx_key, body(TransferMode::Proxy)).await.unwrap();

        h.fanout.handle_response(&PeerKey::station("A"), failed(&request_id, "A")).await.unwrap();
        assert_eq!(h.fanout.request(&rx_key, &request_id).unwrap().status, "assigned");

        h.fanout.handle_response(&PeerKey::station("B"), failed(&request_id, "B")).await.unwrap();
        assert_eq!(h.fanout.request(&rx_key, &request_id).unwrap().status, "error");
    }

    #[tokio::test]
    async fn fanout_count_tracks_accepted_deliveries() {
        let h = harness();
        let rx_key = PeerKey::receiver("rx");
        let _a = connect(&h, PeerKey::station("A")).await;
        {
            let conn = store::lock(&h.db);
            stations::mark_connected(&conn, "ghost", store::now_unix()).unwrap();
        }

        let request_id = h.fanout.create_request(&rx_key, body(TransferMode::Proxy)).await.unwrap();
        let view = h.fanout.request(&rx_key, &request_id).unwrap();
        assert_eq!(view.fanout_count, 1);
        assert_eq!(view.assigned_station.as_deref(), Some("A"));

        h.fanout.handle_response(&PeerKey::station("A"), failed(&request_id, "A")).await.unwrap();
        assert_eq!(h.fanout.request(&rx_key, &request_id).unwrap().status, "error");
    }

    #[tokio::test]
    async fn error_before_delivery_settles_still_fails_the_request() {
        let h = harness();
        let rx_key = PeerKey::receiver("rx");
        let request_id = "r-early";
        {
            let conn = store::lock(&h.db);
            requests::insert_request(
                &conn,
                &NewRequest {
                    request_id,
                    request_type: "pcap",
                    parameters: &json!({}),
                    requester_id: "rx",
                    transfer_mode: TransferMode::Proxy,
                    created_at: store::now_unix(),
                },
            )
            .unwrap();
            requests::mark_assigned(&conn, request_id, "A", 2).unwrap();
        }

        // A fails while the second delivery is still being attempted.
        h.fanout.handle_response(&PeerKey::station("A"), failed(request_id, "A")).await.unwrap();
        assert_eq!(h.fanout.request(&rx_key, request_id).unwrap().status, "assigned");

        h.fanout.settle_fanout(request_id, "A", 1).unwrap();
        let view = h.fanout.request(&rx_key, request_id).unwrap();
        assert_eq!(view.fanout_count, 1);
        assert_eq!(view.status, "error");
    }

    #[tokio::test]
    async fn ready_before_delivery_settles_keeps_the_fanout() {
        let h = harness();
        let rx_key = PeerKey::receiver("rx");
        let _a = connect(&h, PeerKey::station("A")).await;
        let request_id = h.fanout.create_request(&rx_key, body(TransferMode::Proxy)).await.unwrap();

        h.fanout.handle_response(&PeerKey::station("A"), ready(&request_id, "A")).await.unwrap();
        h.fanout.settle_fanout(&request_id, "A", 1).unwrap();

        let view = h.fanout.request(&rx_key, &request_id).unwrap();
        assert_eq!(view.status, "ready");
        assert_eq!(view.fanout_count, 1);
        assert_eq!(view.assigned_station.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn stations_cannot_report_for_each_other() {
        let h = harness();
        let rx_key = PeerKey::receiver("rx");
        let _a = connect(&h, PeerKey::station("A")).await;
        let request_id = h.fanout.create_request(&rx_key, body(TransferMode::Proxy)).await.unwrap();

        let err = h
            .fanout
            .handle_response(&PeerKey::station("B"), ready(&request_id, "A"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Authorization(_)));

        let err = h
            .fanout
            .results(&PeerKey::receiver("other"), &request_id)
            .unwrap_err();
        assert!(matches!(err, RelayError::Authorization(_)));
    }

    #[tokio::test]
    async fn download_target_requires_a_ready_url() {
        let h = harness();
        let rx_key = PeerKey::receiver("rx");
        let _a = connect(&h, PeerKey::station("A")).await;
        let request_id = h.fanout.create_request(&rx_key, body(TransferMode::Proxy)).await.unwrap();

        assert!(matches!(
            h.fanout.download_target(&rx_key, &request_id, "A"),
            Err(RelayError::NotFound(_))
        ));
        h.fanout.handle_response(&PeerKey::station("A"), ready(&request_id, "A")).await.unwrap();
        assert_eq!(
            h.fanout.download_target(&rx_key, &request_id, "A").unwrap(),
            "http://A.local/A.pcap"
        );
    }

    #[test]
    fn freshest_first_orders_by_heartbeat() {
        let rec = |id: &str, hb: i64| StationRecord {
            station_id: id.into(),
            connected: true,
            last_heartbeat: Some(hb),
            last_connected: 0,
        };
        let ranked = FreshestFirst.rank(vec![rec("a", 10), rec("b", 30), rec("c", 20), rec("d", 30)]);
        let ids: Vec<_> = ranked.iter().map(|s| s.station_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "c", "a"]);
    }
}
