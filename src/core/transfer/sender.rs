//! Sending side: metadata frame, fixed-size chunks, backpressure, drain.

use super::{ChunkChannel, FileMetadata};
use crate::core::config::{CHUNK_SIZE, DC_BACKPRESSURE_MAX_WAIT, DC_BUFFERED_AMOUNT_HIGH, DC_BUFFER_POLL_INTERVAL};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::{debug, info};

/// Stream the file at `path` as `filename`. Returns the number of bytes sent.
pub async fn send_file<C: ChunkChannel>(channel: &C, path: &Path, filename: &str) -> Result<u64> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let size = file
        .metadata()
        .await
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    send_reader(channel, file, filename, size).await
}

/// Stream exactly `size` bytes from `reader`.
pub async fn send_reader<C, R>(channel: &C, mut reader: R, filename: &str, size: u64) -> Result<u64>
where
    C: ChunkChannel,
    R: AsyncRead + Unpin,
{
    let meta = FileMetadata {
        filename: filename.to_string(),
        size,
    };
    channel
        .send_text(serde_json::to_string(&meta)?)
        .await
        .context("sending file metadata")?;

    let mut sent: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while sent < size {
        let want = CHUNK_SIZE.min((size - sent) as usize);
        let n = read_full(&mut reader, &mut buf[..want]).await?;
        if n < want {
            bail!("source ended after {} of {} bytes", sent + n as u64, size);
        }
        wait_for_buffer_space(channel).await?;
        channel
            .send_binary(Bytes::copy_from_slice(&buf[..n]))
            .await
            .with_context(|| format!("sending chunk at offset {sent}"))?;
        sent += n as u64;
    }

    drain(channel).await?;
    info!(
        event = "transfer_sent",
        channel = %channel.label(),
        filename,
        bytes = sent,
        "File sent and drained"
    );
    Ok(sent)
}

/// Fill `buf` unless the reader hits EOF first.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// How a buffer wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Below,
    Closed,
}

/// Pause while the channel's send buffer is above the high water mark.
async fn wait_for_buffer_space<C: ChunkChannel>(channel: &C) -> Result<()> {
    if channel.buffered_amount().await <= DC_BUFFERED_AMOUNT_HIGH {
        return Ok(());
    }
    debug!(
        event = "transfer_backpressure",
        channel = %channel.label(),
        high_watermark = DC_BUFFERED_AMOUNT_HIGH,
        "Waiting for send buffer to drain"
    );
    match wait_until(channel, DC_BUFFERED_AMOUNT_HIGH).await? {
        BufferState::Below => Ok(()),
        BufferState::Closed => Err(anyhow!("channel '{}' closed while sending", channel.label())),
    }
}

/// Block until every queued byte has left the channel.
///
/// Every chunk is queued by now. The receiver closes as soon as its total
/// reaches the announced size, so a close here ends the transfer normally.
async fn drain<C: ChunkChannel>(channel: &C) -> Result<()> {
    if wait_until(channel, 0).await? == BufferState::Closed {
        debug!(event = "transfer_closed_by_peer", channel = %channel.label(), "Peer closed the channel after the last chunk");
    }
    Ok(())
}

async fn wait_until<C: ChunkChannel>(channel: &C, threshold: usize) -> Result<BufferState> {
    let deadline = Instant::now() + DC_BACKPRESSURE_MAX_WAIT;
    loop {
        if !channel.is_open() {
            return Ok(BufferState::Closed);
        }
        let buffered = channel.buffered_amount().await;
        if buffered <= threshold {
            return Ok(BufferState::Below);
        }
        if Instant::now() >= deadline {
            return Err(anyhow!(
                "channel '{}' stuck with {buffered} buffered bytes",
                channel.label()
            ));
        }
        tokio::time::sleep(DC_BUFFER_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory channel whose buffer drains a fixed amount per poll.
    #[derive(Default)]
    struct FakeChannel {
        text: Mutex<Vec<String>>,
        chunks: Mutex<Vec<Bytes>>,
        buffered: AtomicUsize,
        peak: AtomicUsize,
        closed: AtomicBool,
        /// Close right after the next binary send, like a receiver that is done.
        close_after_send: AtomicBool,
    }

    impl ChunkChannel for FakeChannel {
        fn label(&self) -> String {
            "fake".into()
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn buffered_amount(&self) -> usize {
            let now = self.buffered.load(Ordering::SeqCst);
            let next = now.saturating_sub(CHUNK_SIZE);
            self.buffered.store(next, Ordering::SeqCst);
            now
        }

        async fn send_text(&self, text: String) -> Result<()> {
            self.text.lock().unwrap().push(text);
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> Result<()> {
            let now = self.buffered.fetch_add(data.len(), Ordering::SeqCst) + data.len();
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.chunks.lock().unwrap().push(data);
            if self.close_after_send.load(Ordering::SeqCst) {
                self.closed.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn splits_into_exact_chunks_and_drains() {
        let channel = FakeChannel::default();
        let data: Vec<u8> = (0..(CHUNK_SIZE + 1)).map(|i| (i % 251) as u8).collect();

        let sent = send_reader(&channel, &data[..], "a.pcap", data.len() as u64).await.unwrap();
        assert_eq!(sent, 16385);

        let text = channel.text.lock().unwrap();
        assert_eq!(text.len(), 1);
        let meta: FileMetadata = serde_json::from_str(&text[0]).unwrap();
        assert_eq!(meta.size, 16385);

        let chunks = channel.chunks.lock().unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![16384, 1]);
        assert_eq!(chunks.concat(), data);
        assert_eq!(channel.buffered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn buffer_stays_near_high_water_mark() {
        let channel = FakeChannel::default();
        let data = vec![7u8; CHUNK_SIZE * 20];
        send_reader(&channel, &data[..], "big.pcap", data.len() as u64).await.unwrap();
        assert!(channel.peak.load(Ordering::SeqCst) <= DC_BUFFERED_AMOUNT_HIGH + CHUNK_SIZE);
        assert_eq!(channel.chunks.lock().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn empty_file_sends_only_metadata() {
        let channel = FakeChannel::default();
        let sent = send_reader(&channel, &b""[..], "empty.pcap", 0).await.unwrap();
        assert_eq!(sent, 0);
        assert!(channel.chunks.lock().unwrap().is_empty());
        assert_eq!(channel.text.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn short_source_is_an_error() {
        let channel = FakeChannel::default();
        let err = send_reader(&channel, &[1u8, 2, 3][..], "short.pcap", 10).await.unwrap_err();
        assert!(err.to_string().contains("3 of 10"));
    }

    #[tokio::test]
    async fn closed_channel_aborts_backpressure_wait() {
        let channel = FakeChannel::default();
        channel.buffered.store(DC_BUFFERED_AMOUNT_HIGH * 4, Ordering::SeqCst);
        channel.closed.store(true, Ordering::SeqCst);
        let data = vec![0u8; 10];
        let err = send_reader(&channel, &data[..], "x", 10).await.unwrap_err();
        assert!(err.to_string().contains("closed while sending"));
    }

    #[tokio::test]
    async fn close_after_last_chunk_counts_as_delivered() {
        let channel = FakeChannel::default();
        channel.close_after_send.store(true, Ordering::SeqCst);
        let data = vec![3u8; 100];
        let sent = send_reader(&channel, &data[..], "done.pcap", 100).await.unwrap();
        assert_eq!(sent, 100);
        assert!(!channel.is_open());
        assert_eq!(channel.chunks.lock().unwrap().concat(), data);
    }
}
