//! HTTP API.
//!
//! One request per connection (`Connection: close`). The caller is
//! identified by its bearer token; only `/health` is public.
//!
//! | Method | Path                                         |
//! |--------|----------------------------------------------|
//! | GET    | `/health`                                    |
//! | POST   | `/requests`                                  |
//! | GET    | `/requests/{id}`                             |
//! | GET    | `/requests/{id}/results`                     |
//! | GET    | `/requests/{id}/stations/{station}/download` |
//! | POST   | `/ice/signal`                                |
//! | GET    | `/ice/sessions/{id}/candidates`              |
//! | POST   | `/ice/sessions/{id}/respond`                 |

use super::parse::{error_response, find_header_end, json_response, parse_content_length, response_head, HttpRequest};
use super::ServerState;
use crate::core::config::{MAX_HTTP_REQUEST_BYTES, PROXY_CONNECT_TIMEOUT};
use crate::core::error::{RelayError, RelayResult};
use crate::core::protocol::api::{CreateRequestBody, CreateRequestResponse, RespondBody, SignalAck, SignalKind, SignalRequest};
use crate::core::protocol::{PeerRole, SdpKind, Signal};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

/// What a route produced.
enum Reply {
    Body(String),
    /// Stream the station's advertised URL back to the caller.
    Proxy { url: String, station_id: String },
}

pub async fn serve(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                warn!(event = "http_accept_failure", error = %e, "Failed to accept connection");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, &state).await {
                debug!(event = "http_connection_error", %addr, error = %e, "HTTP connection ended with error");
            }
        });
    }
}

/// Read until headers plus `Content-Length` bytes are buffered.
async fn read_request(socket: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(if buf.is_empty() { None } else { Some(buf) });
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HTTP_REQUEST_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request too large",
            ));
        }
        if let Some(header_end) = find_header_end(&buf) {
            let headers = String::from_utf8_lossy(&buf[..header_end]);
            if buf.len() >= header_end + parse_content_length(&headers) {
                return Ok(Some(buf));
            }
        }
    }
}

async fn handle_connection(mut socket: TcpStream, state: &ServerState) -> anyhow::Result<()> {
    let raw = match read_request(&mut socket).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            socket.write_all(error_response(413, "request too large").as_bytes()).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let Some(request) = HttpRequest::parse(&raw) else {
        socket.write_all(error_response(400, "malformed request").as_bytes()).await?;
        return Ok(());
    };

    let reply = match route(state, &request).await {
        Ok(reply) => reply,
        Err(e) => {
            if e.is_client_error() {
                debug!(event = "http_client_error", method = %request.method, path = %request.path, error = %e, "Request rejected");
            } else {
                warn!(event = "http_server_error", method = %request.method, path = %request.path, error = %e, "Request failed");
            }
            Reply::Body(error_response(e.status_code(), &e.message()))
        }
    };

    match reply {
        Reply::Body(response) => socket.write_all(response.as_bytes()).await?,
        Reply::Proxy { url, station_id } => proxy_download(state, &mut socket, &url, &station_id).await?,
    }

    if let Err(e) = socket.shutdown().await {
        trace!(event = "http_shutdown", error = %e, "Socket shutdown error");
    }
    Ok(())
}

async fn route(state: &ServerState, req: &HttpRequest) -> RelayResult<Reply> {
    let segments = req.segments();
    if req.method == "GET" && segments == ["health"] {
        return Ok(Reply::Body(json_response(
            200,
            &json!({
                "status": "ok",
                "stations": state.registry.connected(PeerRole::Station).await.len(),
                "receivers": state.registry.connected(PeerRole::Receiver).await.len(),
            }),
        )));
    }

    let caller = state
        .tokens
        .bearer(&req.headers)
        .cloned()
        .ok_or_else(|| RelayError::Authorization("missing or unknown bearer token".into()))?;

    let body = match (req.method.as_str(), segments.as_slice()) {
        ("POST", ["requests"]) => {
            let body: CreateRequestBody = parse_body(req)?;
            let request_id = state.fanout.create_request(&caller, body).await?;
            json_response(200, &CreateRequestResponse { request_id })
        }
        ("GET", ["requests", id]) => json_response(200, &state.fanout.request(&caller, id)?),
        ("GET", ["requests", id, "results"]) => json_response(200, &state.fanout.results(&caller, id)?),
        ("GET", ["requests", id, "stations", station_id, "download"]) => {
            let url = state.fanout.download_target(&caller, id, station_id)?;
            return Ok(Reply::Proxy {
                url,
                station_id: station_id.to_string(),
            });
        }
        ("POST", ["ice", "signal"]) => {
            let body: SignalRequest = parse_body(req)?;
            let (session_id, signal) = into_signal(body)?;
            let outcome = state.relay.relay(&caller, &session_id, signal).await?;
            json_response(
                200,
                &SignalAck {
                    session_id: outcome.session_id,
                    status: outcome.status.as_str().to_string(),
                    delivered: outcome.delivered,
                },
            )
        }
        ("GET", ["ice", "sessions", id, "candidates"]) => {
            json_response(200, &state.relay.pending_candidates(&caller, id)?)
        }
        ("POST", ["ice", "sessions", id, "respond"]) => {
            let body: RespondBody = parse_body(req)?;
            let outcome = state.relay.respond(&caller, id, body.accept).await?;
            json_response(
                200,
                &SignalAck {
                    session_id: outcome.session_id,
                    status: outcome.status.as_str().to_string(),
                    delivered: outcome.delivered,
                },
            )
        }
        _ => return Err(RelayError::NotFound(format!("{} {}", req.method, req.path))),
    };
    Ok(Reply::Body(body))
}

fn parse_body<T: DeserializeOwned>(req: &HttpRequest) -> RelayResult<T> {
    serde_json::from_slice(&req.body).map_err(|e| RelayError::Validation(format!("invalid JSON body: {e}")))
}

/// Check that the body carries the field its `type` needs.
fn into_signal(req: SignalRequest) -> RelayResult<(String, Signal)> {
    let signal = match (req.kind, req.session_description, req.ice_candidate) {
        (SignalKind::Offer, Some(desc), _) if desc.kind == SdpKind::Offer => Signal::Offer(desc),
        (SignalKind::Answer, Some(desc), _) if desc.kind == SdpKind::Answer => Signal::Answer(desc),
        (SignalKind::Candidate, _, Some(candidate)) => Signal::Candidate(candidate),
        (SignalKind::Candidate, _, None) => {
            return Err(RelayError::Validation("candidate signal without ice_candidate".into()))
        }
        _ => {
            return Err(RelayError::Validation(
                "session_description missing or of the wrong type".into(),
            ))
        }
    };
    Ok((req.session_id, signal))
}

/// Stream a station's file to the caller without buffering it.
async fn proxy_download(
    state: &ServerState,
    socket: &mut TcpStream,
    url: &str,
    station_id: &str,
) -> anyhow::Result<()> {
    let upstream = match open_upstream(state, url, station_id).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(event = "proxy_upstream_failure", station_id, url, error = %e, "Station download failed");
            socket.write_all(error_response(e.status_code(), &e.message()).as_bytes()).await?;
            return Ok(());
        }
    };

    let head = response_head(200, "application/octet-stream", upstream.content_length());
    socket.write_all(head.as_bytes()).await?;

    let mut total: u64 = 0;
    let mut body = upstream.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        socket.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    info!(event = "proxy_download_complete", station_id, bytes = total, "Proxied station file");
    Ok(())
}

/// Connect to the station's advertised URL. Only the response head is
/// bounded by [`PROXY_CONNECT_TIMEOUT`]; the body streams for as long as it takes.
async fn open_upstream(state: &ServerState, url: &str, station_id: &str) -> RelayResult<reqwest::Response> {
    let resp = match tokio::time::timeout(PROXY_CONNECT_TIMEOUT, state.http.get(url).send()).await {
        Err(_) => {
            return Err(RelayError::Timeout(format!(
                "station {station_id} did not answer within {}s",
                PROXY_CONNECT_TIMEOUT.as_secs()
            )))
        }
        Ok(Err(e)) if e.is_timeout() => {
            return Err(RelayError::Timeout(format!("station {station_id} timed out")))
        }
        Ok(Err(_)) => return Err(RelayError::TransientIo(format!("station {station_id} unreachable"))),
        Ok(Ok(resp)) => resp,
    };
    if !resp.status().is_success() {
        return Err(RelayError::TransientIo(format!(
            "station {station_id} answered {}",
            resp.status()
        )));
    }
    Ok(resp)
}
