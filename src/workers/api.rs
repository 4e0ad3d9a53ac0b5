//! HTTP client for the server API, as used by the receiver.

use crate::core::protocol::api::{
    CandidateView, CreateRequestBody, CreateRequestResponse, ErrorBody, RequestView, RespondBody, SignalAck,
    SignalKind, SignalRequest, StationResult,
};
use crate::core::protocol::{IceCandidatePayload, OutgoingSignal, Signal};
use anyhow::{anyhow, bail, Context, Result};
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

const API_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Error from a non-2xx reply, with the server's `{"error": ..}` message.
#[derive(Debug, thiserror::Error)]
#[error("HTTP {status} - {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Clone)]
pub struct RelayApi {
    base_url: Url,
    client: Client,
    token: String,
}

impl RelayApi {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        let mut base_url = Url::parse(base_url).with_context(|| format!("invalid API URL '{base_url}'"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            client: Client::new(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.authed(request).timeout(API_CALL_TIMEOUT).send().await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn create_request(&self, body: &CreateRequestBody) -> Result<String> {
        let reply: CreateRequestResponse = self
            .call(self.client.post(self.url("requests")?).json(body))
            .await?;
        Ok(reply.request_id)
    }

    pub async fn request(&self, request_id: &str) -> Result<RequestView> {
        self.call(self.client.get(self.url(&format!("requests/{request_id}"))?))
            .await
    }

    pub async fn results(&self, request_id: &str) -> Result<Vec<StationResult>> {
        self.call(self.client.get(self.url(&format!("requests/{request_id}/results"))?))
            .await
    }

    pub async fn signal(&self, out: &OutgoingSignal) -> Result<SignalAck> {
        let body = match &out.signal {
            Signal::Offer(desc) | Signal::Answer(desc) => SignalRequest {
                session_id: out.session_id.clone(),
                kind: match out.signal {
                    Signal::Offer(_) => SignalKind::Offer,
                    _ => SignalKind::Answer,
                },
                session_description: Some(desc.clone()),
                ice_candidate: None,
            },
            Signal::Candidate(c) => SignalRequest {
                session_id: out.session_id.clone(),
                kind: SignalKind::Candidate,
                session_description: None,
                ice_candidate: Some(c.clone()),
            },
        };
        self.call(self.client.post(self.url("ice/signal")?).json(&body))
            .await
    }

    pub async fn candidates(&self, session_id: &str) -> Result<Vec<IceCandidatePayload>> {
        let rows: Vec<CandidateView> = self
            .call(self.client.get(self.url(&format!("ice/sessions/{session_id}/candidates"))?))
            .await?;
        Ok(rows.into_iter().map(|r| r.ice_candidate).collect())
    }

    pub async fn respond(&self, session_id: &str, accept: bool) -> Result<SignalAck> {
        self.call(
            self.client
                .post(self.url(&format!("ice/sessions/{session_id}/respond"))?)
                .json(&RespondBody { accept }),
        )
        .await
    }

    /// Stream one station's file through the server proxy into `dest`.
    /// Written to `dest.part` first and renamed on success.
    pub async fn download(&self, request_id: &str, station_id: &str, dest: &Path) -> Result<u64> {
        let url = self.url(&format!("requests/{request_id}/stations/{station_id}/download"))?;
        let response = check(self.authed(self.client.get(url)).send().await?).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut part = dest.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);

        let result = write_stream(response, &part).await;
        match result {
            Ok(bytes) => {
                tokio::fs::rename(&part, dest)
                    .await
                    .with_context(|| format!("renaming {}", part.display()))?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }
}

async fn write_stream(response: Response, path: &Path) -> Result<u64> {
    let expected = response.content_length();
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("download interrupted")?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    if let Some(expected) = expected {
        if written != expected {
            bail!("download ended after {written} of {expected} bytes");
        }
    }
    Ok(written)
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);
    Err(anyhow!(ApiError { status, message }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_a_trailing_slash() {
        let api = RelayApi::new("http://127.0.0.1:8766/api", "t").unwrap();
        assert_eq!(
            api.url("requests/abc/results").unwrap().as_str(),
            "http://127.0.0.1:8766/api/requests/abc/results"
        );
        let api = RelayApi::new("http://127.0.0.1:8766", "t").unwrap();
        assert_eq!(api.url("ice/signal").unwrap().as_str(), "http://127.0.0.1:8766/ice/signal");
    }

    #[tokio::test]
    async fn no_fresh_stations_surfaces_as_503() {
        use crate::core::protocol::PeerKey;
        use crate::core::store;
        use crate::server::auth::TokenTable;
        use crate::server::{http, ServerState};

        let mut tokens = TokenTable::default();
        tokens.insert("tok-rx", PeerKey::receiver("rx"));
        let state = ServerState::new(store::open_in_memory().unwrap(), tokens);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(http::serve(listener, state));

        let api = RelayApi::new(&format!("http://{addr}"), "tok-rx").unwrap();
        let err = api
            .create_request(&CreateRequestBody {
                request_type: "pcap".into(),
                parameters: serde_json::json!({}),
                transfer_mode: Default::default(),
            })
            .await
            .unwrap_err();
        let api_err = err.downcast_ref::<ApiError>().unwrap();
        assert_eq!(api_err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api_err.message, "no collectors available");

        let unauthorized = RelayApi::new(&format!("http://{addr}"), "bogus").unwrap();
        let err = unauthorized.results("r1").await.unwrap_err();
        assert_eq!(err.downcast_ref::<ApiError>().unwrap().status, StatusCode::FORBIDDEN);
    }
}
