//! Receiving side: reassembles the payload into `<dest>/<filename>`.
//!
//! Bytes land in a `.part` file that is renamed once the running total
//! equals the announced size. A close after that point is expected; a close
//! before it, or any byte past the announced size, fails the transfer.

use super::{sanitize_relative_path, FileMetadata};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the channel delivered, as seen by the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Text(String),
    Binary(Bytes),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    InProgress,
    Complete,
}

pub struct IncomingTransfer {
    dest_dir: PathBuf,
    metadata: Option<FileMetadata>,
    file: Option<tokio::fs::File>,
    part_path: Option<PathBuf>,
    final_path: Option<PathBuf>,
    received: u64,
    complete: bool,
}

impl IncomingTransfer {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            metadata: None,
            file: None,
            part_path: None,
            final_path: None,
            received: 0,
            complete: false,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn final_path(&self) -> Option<&Path> {
        self.final_path.as_deref()
    }

    pub async fn on_text(&mut self, text: &str) -> Result<Progress> {
        if self.metadata.is_some() {
            bail!("unexpected text frame after file metadata");
        }
        let meta: FileMetadata = serde_json::from_str(text).context("invalid file metadata frame")?;

        let final_path = self.dest_dir.join(sanitize_relative_path(&meta.filename));
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut part = final_path.clone().into_os_string();
        part.push(".part");
        let part_path = PathBuf::from(part);
        let file = tokio::fs::File::create(&part_path)
            .await
            .with_context(|| format!("creating {}", part_path.display()))?;

        debug!(
            event = "transfer_started",
            filename = %meta.filename,
            size = meta.size,
            dest = %final_path.display(),
            "Incoming file announced"
        );

        let empty = meta.size == 0;
        self.metadata = Some(meta);
        self.file = Some(file);
        self.part_path = Some(part_path);
        self.final_path = Some(final_path);

        if empty {
            self.finalize().await?;
            return Ok(Progress::Complete);
        }
        Ok(Progress::InProgress)
    }

    pub async fn on_binary(&mut self, data: &[u8]) -> Result<Progress> {
        let size = match &self.metadata {
            Some(meta) => meta.size,
            None => bail!("binary frame before file metadata"),
        };
        if self.complete {
            bail!("{} bytes received after transfer completed", data.len());
        }
        let total = self.received + data.len() as u64;
        if total > size {
            bail!("received {total} bytes, more than the announced {size}");
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("transfer file already closed"))?;
        file.write_all(data).await.context("writing chunk")?;
        self.received = total;

        if self.received == size {
            self.finalize().await?;
            return Ok(Progress::Complete);
        }
        Ok(Progress::InProgress)
    }

    /// The channel closed. Fine after completion, a transient failure before.
    pub fn on_close(&self) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }
        let size = self.metadata.as_ref().map(|m| m.size);
        Err(anyhow!(
            "channel closed after {} of {} bytes",
            self.received,
            size.map_or_else(|| "unknown".to_string(), |s| s.to_string())
        ))
    }

    async fn finalize(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let (Some(part), Some(dest)) = (&self.part_path, &self.final_path) else {
            bail!("finalize without metadata");
        };
        tokio::fs::rename(part, dest)
            .await
            .with_context(|| format!("renaming {} to {}", part.display(), dest.display()))?;
        self.complete = true;
        info!(
            event = "transfer_received",
            dest = %dest.display(),
            bytes = self.received,
            "File received"
        );
        Ok(())
    }

    /// Best-effort removal of a half-written `.part` file.
    pub async fn discard(&mut self) {
        self.file.take();
        if self.is_complete() {
            return;
        }
        if let Some(part) = &self.part_path {
            if let Err(e) = tokio::fs::remove_file(part).await {
                debug!(event = "transfer_discard_failure", path = %part.display(), error = %e, "Could not remove partial file");
            }
        }
    }
}

/// Feed channel events into a transfer until it completes or fails.
pub async fn receive(events: &mut mpsc::UnboundedReceiver<ChannelEvent>, dest_dir: &Path) -> Result<PathBuf> {
    let mut transfer = IncomingTransfer::new(dest_dir);
    let result = pump(events, &mut transfer).await;
    if let Err(e) = &result {
        warn!(event = "transfer_failed", received = transfer.received(), error = %e, "Incoming transfer aborted");
        transfer.discard().await;
    }
    result
}

async fn pump(
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    transfer: &mut IncomingTransfer,
) -> Result<PathBuf> {
    loop {
        let progress = match events.recv().await {
            Some(ChannelEvent::Text(text)) => transfer.on_text(&text).await?,
            Some(ChannelEvent::Binary(data)) => transfer.on_binary(&data).await?,
            Some(ChannelEvent::Closed) | None => {
                transfer.on_close()?;
                Progress::Complete
            }
        };
        if progress == Progress::Complete {
            return transfer
                .final_path()
                .map(Path::to_path_buf)
                .ok_or_else(|| anyhow!("transfer completed without a destination"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "capture_relay_rx_{}_{}",
            name,
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn meta(name: &str, size: u64) -> String {
        serde_json::to_string(&FileMetadata {
            filename: name.into(),
            size,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn one_byte_over_a_chunk_completes() {
        let dir = temp_dir("exact");
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ChannelEvent::Text(meta("a.pcap", 16385))).unwrap();
        tx.send(ChannelEvent::Binary(Bytes::from(vec![1u8; 16384]))).unwrap();
        tx.send(ChannelEvent::Binary(Bytes::from_static(&[2u8]))).unwrap();
        // Close right after the last byte is tolerated.
        tx.send(ChannelEvent::Closed).unwrap();

        let path = receive(&mut rx, &dir).await.unwrap();
        assert_eq!(path, dir.join("a.pcap"));
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 16385);
        assert_eq!(data[16384], 2);
        assert!(!dir.join("a.pcap.part").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn early_close_is_an_error_and_cleans_up() {
        let dir = temp_dir("early");
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ChannelEvent::Text(meta("b.pcap", 100))).unwrap();
        tx.send(ChannelEvent::Binary(Bytes::from(vec![0u8; 40]))).unwrap();
        tx.send(ChannelEvent::Closed).unwrap();

        let err = receive(&mut rx, &dir).await.unwrap_err();
        assert!(err.to_string().contains("40 of 100"));
        assert!(!dir.join("b.pcap.part").exists());
        assert!(!dir.join("b.pcap").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn overflow_is_a_protocol_error() {
        let dir = temp_dir("overflow");
        let mut transfer = IncomingTransfer::new(&dir);
        transfer.on_text(&meta("c.pcap", 10)).await.unwrap();
        assert_eq!(transfer.on_binary(&[0u8; 6]).await.unwrap(), Progress::InProgress);
        let err = transfer.on_binary(&[0u8; 6]).await.unwrap_err();
        assert!(err.to_string().contains("more than the announced"));
        assert_eq!(transfer.received(), 6);

        transfer.discard().await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn zero_size_completes_on_metadata() {
        let dir = temp_dir("zero");
        let mut transfer = IncomingTransfer::new(&dir);
        assert_eq!(transfer.on_text(&meta("empty.pcap", 0)).await.unwrap(), Progress::Complete);
        assert!(transfer.is_complete());
        assert_eq!(std::fs::metadata(dir.join("empty.pcap")).unwrap().len(), 0);
        assert!(transfer.on_close().is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn hostile_filename_stays_inside_destination() {
        let dir = temp_dir("hostile");
        let mut transfer = IncomingTransfer::new(&dir);
        transfer.on_text(&meta("../../escape.pcap", 1)).await.unwrap();
        transfer.on_binary(&[9u8]).await.unwrap();
        assert_eq!(transfer.final_path().unwrap(), dir.join("escape.pcap"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn chunk_before_metadata_is_rejected() {
        let dir = temp_dir("order");
        let mut transfer = IncomingTransfer::new(&dir);
        assert!(transfer.on_binary(&[1, 2, 3]).await.is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
