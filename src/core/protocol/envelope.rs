//! WebSocket envelope: `{"type": "...", "payload": {...}}`.
//!
//! Every message kind is one variant of [`Envelope`]. Encoding goes through
//! serde's adjacent tagging; decoding goes through [`Envelope::decode`],
//! which looks the `type` string up in a dispatch table and deserializes the
//! payload into that variant's struct. A missing or `null` payload is
//! treated as `{}` so bodiless kinds like `heartbeat` decode either way.

use super::{IceCandidatePayload, PeerRole, ResponseStatus, SessionDescription};
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorAuth {
    pub station_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverAuth {
    pub receiver_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSuccess {
    pub peer_id: String,
    pub role: PeerRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthFailure {
    pub reason: String,
}

/// Server → station: produce data for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequestPush {
    pub request_id: String,
    pub request_type: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Station → server: terminal (or progress) outcome for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    pub request_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub station_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub timestamp: u64,
}

/// Server → station: a receiver wants this station's file over a data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIceSession {
    pub session_id: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceDescription {
    pub session_id: String,
    pub session_description: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub session_id: String,
    pub ice_candidate: IceCandidatePayload,
}

/// Server → receiver: one station finished producing its file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataReady {
    pub request_id: String,
    pub station_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDeclined {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    CollectorAuth(CollectorAuth),
    ReceiverAuth(ReceiverAuth),
    AuthSuccess(AuthSuccess),
    AuthFailure(AuthFailure),
    DataRequest(DataRequestPush),
    DataResponse(DataResponse),
    Heartbeat(Heartbeat),
    HeartbeatResponse(HeartbeatResponse),
    NewIceSession(NewIceSession),
    IceOffer(IceDescription),
    IceAnswer(IceDescription),
    IceCandidate(IceCandidate),
    DataReady(DataReady),
    SessionDeclined(SessionDeclined),
    Error(ErrorNotice),
}

type Decoder = fn(Value) -> Result<Envelope>;

fn payload<T: DeserializeOwned>(value: Value) -> Result<T> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };
    Ok(serde_json::from_value(value)?)
}

/// `type` string → payload decoder.
const DISPATCH: &[(&str, Decoder)] = &[
    ("collector_auth", |v| Ok(Envelope::CollectorAuth(payload(v)?))),
    ("receiver_auth", |v| Ok(Envelope::ReceiverAuth(payload(v)?))),
    ("auth_success", |v| Ok(Envelope::AuthSuccess(payload(v)?))),
    ("auth_failure", |v| Ok(Envelope::AuthFailure(payload(v)?))),
    ("data_request", |v| Ok(Envelope::DataRequest(payload(v)?))),
    ("data_response", |v| Ok(Envelope::DataResponse(payload(v)?))),
    ("heartbeat", |v| Ok(Envelope::Heartbeat(payload(v)?))),
    ("heartbeat_response", |v| Ok(Envelope::HeartbeatResponse(payload(v)?))),
    ("new_ice_session", |v| Ok(Envelope::NewIceSession(payload(v)?))),
    ("ice_offer", |v| Ok(Envelope::IceOffer(payload(v)?))),
    ("ice_answer", |v| Ok(Envelope::IceAnswer(payload(v)?))),
    ("ice_candidate", |v| Ok(Envelope::IceCandidate(payload(v)?))),
    ("data_ready", |v| Ok(Envelope::DataReady(payload(v)?))),
    ("session_declined", |v| Ok(Envelope::SessionDeclined(payload(v)?))),
    ("error", |v| Ok(Envelope::Error(payload(v)?))),
];

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl Envelope {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_str(text).context("malformed envelope")?;
        let decoder = DISPATCH
            .iter()
            .find(|(kind, _)| *kind == raw.kind)
            .map(|(_, decoder)| *decoder)
            .ok_or_else(|| anyhow!("unknown message type '{}'", raw.kind))?;
        decoder(raw.payload).with_context(|| format!("invalid '{}' payload", raw.kind))
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The `type` string, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::CollectorAuth(_) => "collector_auth",
            Envelope::ReceiverAuth(_) => "receiver_auth",
            Envelope::AuthSuccess(_) => "auth_success",
            Envelope::AuthFailure(_) => "auth_failure",
            Envelope::DataRequest(_) => "data_request",
            Envelope::DataResponse(_) => "data_response",
            Envelope::Heartbeat(_) => "heartbeat",
            Envelope::HeartbeatResponse(_) => "heartbeat_response",
            Envelope::NewIceSession(_) => "new_ice_session",
            Envelope::IceOffer(_) => "ice_offer",
            Envelope::IceAnswer(_) => "ice_answer",
            Envelope::IceCandidate(_) => "ice_candidate",
            Envelope::DataReady(_) => "data_ready",
            Envelope::SessionDeclined(_) => "session_declined",
            Envelope::Error(_) => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error(ErrorNotice {
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::SdpKind;

    #[test]
    fn every_variant_kind_has_a_decoder() {
        let samples = vec![
            Envelope::Heartbeat(Heartbeat::default()),
            Envelope::error("boom"),
            Envelope::SessionDeclined(SessionDeclined {
                session_id: "s".into(),
            }),
            Envelope::IceOffer(IceDescription {
                session_id: "s".into(),
                session_description: SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0".into(),
                },
            }),
        ];
        for env in samples {
            let text = env.encode().unwrap();
            assert!(DISPATCH.iter().any(|(k, _)| *k == env.kind()));
            assert_eq!(Envelope::decode(&text).unwrap(), env);
        }
    }

    #[test]
    fn heartbeat_without_payload_decodes() {
        let env = Envelope::decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(env, Envelope::Heartbeat(Heartbeat { timestamp: None }));

        let env = Envelope::decode(r#"{"type":"heartbeat","payload":null}"#).unwrap();
        assert!(matches!(env, Envelope::Heartbeat(_)));
    }

    #[test]
    fn data_response_from_station_json() {
        let text = r#"{
            "type": "data_response",
            "payload": {
                "request_id": "r1",
                "status": "ready",
                "file_path": "/captures/a.pcap",
                "file_size": 16385,
                "station_id": "st-1"
            }
        }"#;
        match Envelope::decode(text).unwrap() {
            Envelope::DataResponse(resp) => {
                assert_eq!(resp.status, ResponseStatus::Ready);
                assert_eq!(resp.file_size, Some(16385));
                assert_eq!(resp.download_url, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = Envelope::decode(r#"{"type":"teleport","payload":{}}"#).unwrap_err();
        assert!(err.to_string().contains("unknown message type"));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err = Envelope::decode(r#"{"type":"collector_auth","payload":{"token":"t"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("collector_auth"));
    }
}
