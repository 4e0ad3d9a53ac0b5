//! JSON bodies of the HTTP API.

use super::{IceCandidatePayload, ResponseStatus, SessionDescription, TransferMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `POST /requests`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequestBody {
    pub request_type: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub transfer_mode: TransferMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequestResponse {
    pub request_id: String,
}

/// One row of `GET /requests/{id}/results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationResult {
    pub station_id: String,
    pub status: ResponseStatus,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `GET /requests/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestView {
    pub request_id: String,
    pub request_type: String,
    pub status: String,
    pub transfer_mode: TransferMode,
    pub fanout_count: u32,
    pub assigned_station: Option<String>,
    /// First station that reported ready.
    pub station_id: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub download_url: Option<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// `POST /ice/signal`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_candidate: Option<IceCandidatePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalAck {
    pub session_id: String,
    pub status: String,
    pub delivered: bool,
}

/// `POST /ice/sessions/{id}/respond`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondBody {
    pub accept: bool,
}

/// One row of `GET /ice/sessions/{id}/candidates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateView {
    pub contributor: String,
    #[serde(flatten)]
    pub ice_candidate: IceCandidatePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
