//! Chunked file transfer over an ordered, reliable data channel.
//!
//! Wire format:
//! 1. one text frame `{"type":"file-metadata","filename":..,"size":..}`
//! 2. `ceil(size / CHUNK_SIZE)` binary frames of raw payload, no prefix
//!
//! The receiver completes when its running byte total equals `size`; there
//! is no trailer frame. See [`sender`] and [`receiver`].

pub mod receiver;
pub mod sender;

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Announces the file that follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "file-metadata")]
pub struct FileMetadata {
    pub filename: String,
    pub size: u64,
}

/// The parts of a data channel the sender needs. Implemented for the real
/// webrtc channel and for in-memory fakes in tests.
pub trait ChunkChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    fn buffered_amount(&self) -> impl Future<Output = usize> + Send;
    fn send_text(&self, text: String) -> impl Future<Output = Result<()>> + Send;
    fn send_binary(&self, data: Bytes) -> impl Future<Output = Result<()>> + Send;
}

impl ChunkChannel for Arc<RTCDataChannel> {
    fn label(&self) -> String {
        RTCDataChannel::label(self).to_string()
    }

    fn is_open(&self) -> bool {
        self.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        RTCDataChannel::buffered_amount(self).await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        RTCDataChannel::send_text(self, text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        RTCDataChannel::send(self, &data).await?;
        Ok(())
    }
}

/// Reduce a peer-supplied file name to something safe to create inside the
/// download directory.
///
/// Separators of either style are normalized, `.`/`..` components are
/// dropped, and each remaining component keeps only alphanumerics plus
/// `.`, `-`, `_` and space. Falls back to `"capture"`.
pub fn sanitize_relative_path(name: &str) -> PathBuf {
    let mut result = PathBuf::new();
    for part in name.split(['/', '\\']).filter(|s| !s.is_empty()) {
        if matches!(part, "." | "..") {
            continue;
        }
        let safe: String = part
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
            .collect();
        if !safe.is_empty() && safe != "." && safe != ".." {
            result.push(safe);
        }
    }
    if result.as_os_str().is_empty() {
        PathBuf::from("capture")
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_wire_shape() {
        let meta = FileMetadata {
            filename: "eth0.pcap".into(),
            size: 16385,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"type":"file-metadata","filename":"eth0.pcap","size":16385}"#);
        assert_eq!(serde_json::from_str::<FileMetadata>(&json).unwrap(), meta);
    }

    #[test]
    fn sanitize_strips_traversal() {
        assert_eq!(sanitize_relative_path("../../etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(sanitize_relative_path("..\\captures\\a.pcap"), PathBuf::from("captures/a.pcap"));
        assert_eq!(sanitize_relative_path("/abs/x?.pcap"), PathBuf::from("abs/x.pcap"));
        assert_eq!(sanitize_relative_path("../.."), PathBuf::from("capture"));
        assert_eq!(sanitize_relative_path(".?."), PathBuf::from("capture"));
    }
}
