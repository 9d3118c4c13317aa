//! Pluggable backends for the Virtual Media Engine's NBD server. Each
//! backend answers positioned byte-range reads; `nbd.rs` is the only caller.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use kvmd_protocol::DiskChunkHeader;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, oneshot, Mutex};

type ReadFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>>;

/// Object-safe so mounted media can swap between Storage/Http/WebRtc without
/// the rest of the engine knowing which.
pub trait DiskBackend: Send + Sync {
    fn read_at(&self, offset: u64, len: u32) -> ReadFuture<'_>;
    fn size(&self) -> u64;
}

/// Reads from a local file, positioned per-request. Used for both mounted
/// storage images and completed uploads.
pub struct StorageBackend {
    path: PathBuf,
    size: u64,
}

impl StorageBackend {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;
        Ok(Self { path, size: meta.len() })
    }
}

impl DiskBackend for StorageBackend {
    fn read_at(&self, offset: u64, len: u32) -> ReadFuture<'_> {
        Box::pin(async move {
            let mut file = tokio::fs::File::open(&self.path)
                .await
                .with_context(|| format!("failed to open {}", self.path.display()))?;
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf).await.context("short read from storage backend")?;
            Ok(buf)
        })
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Reads via HTTP byte-range GETs against a remote URL. Rejected up front at
/// construction if the server doesn't advertise range support.
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    size: u64,
}

impl HttpBackend {
    pub async fn probe(client: reqwest::Client, url: String) -> Result<Self> {
        let resp = client
            .head(&url)
            .send()
            .await
            .with_context(|| format!("HEAD request to {url} failed"))?;

        let accepts_ranges = resp
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .map(|v| v.as_bytes() == b"bytes")
            .unwrap_or(false);
        if !accepts_ranges {
            bail!("server at {url} does not advertise Accept-Ranges: bytes");
        }

        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| anyhow::anyhow!("server at {url} did not return Content-Length"))?;

        Ok(Self { client, url, size })
    }
}

impl DiskBackend for HttpBackend {
    fn read_at(&self, offset: u64, len: u32) -> ReadFuture<'_> {
        Box::pin(async move {
            let end = offset + len as u64 - 1;
            let resp = self
                .client
                .get(&self.url)
                .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
                .send()
                .await
                .context("ranged GET failed")?;
            if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
                bail!("expected 206 Partial Content, got {}", resp.status());
            }
            let bytes = resp.bytes().await.context("failed to read response body")?;
            Ok(bytes.to_vec())
        })
    }

    fn size(&self) -> u64 {
        self.size
    }
}

struct PendingRead {
    start: u64,
    end: u64,
    reply: oneshot::Sender<Vec<u8>>,
}

/// Issues `{start,end}` read requests over the browser's "disk" data channel
/// and accumulates the reply payload across messages. The original
/// implementation this was ported from replaced its buffer with each new
/// message instead of appending to it, silently truncating any read
/// satisfied by more than one message — this backend always appends.
pub struct WebRtcBackend {
    size: u64,
    request_tx: mpsc::Sender<PendingRead>,
}

impl WebRtcBackend {
    /// `send_request` pushes a `{start,end}` JSON text message to the
    /// browser; the caller feeds binary reply messages back in via
    /// `on_message`.
    pub fn new(size: u64, send_request: impl Fn(u64, u64) + Send + Sync + 'static) -> (Self, WebRtcBackendHandle) {
        let (request_tx, mut request_rx) = mpsc::channel::<PendingRead>(8);
        let current = Arc::new(Mutex::new(None::<(PendingRead, Vec<u8>)>));

        let current_for_task = Arc::clone(&current);
        tokio::spawn(async move {
            while let Some(pending) = request_rx.recv().await {
                send_request(pending.start, pending.end);
                *current_for_task.lock().await = Some((pending, Vec::new()));
            }
        });

        (Self { size, request_tx }, WebRtcBackendHandle { current })
    }
}

impl DiskBackend for WebRtcBackend {
    fn read_at(&self, offset: u64, len: u32) -> ReadFuture<'_> {
        Box::pin(async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.request_tx
                .send(PendingRead { start: offset, end: offset + len as u64, reply: reply_tx })
                .await
                .context("disk channel request queue closed")?;
            reply_rx.await.context("disk channel reader dropped before replying")
        })
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Fed browser-side binary messages by whatever owns the "disk" data
/// channel; not a `DiskBackend` itself since it only ever receives.
pub struct WebRtcBackendHandle {
    current: Arc<Mutex<Option<(PendingRead, Vec<u8>)>>>,
}

impl WebRtcBackendHandle {
    /// Feed one binary message from the browser. Accumulates payload bytes
    /// into the in-flight read until the declared length is reached, then
    /// resolves that read's waiter.
    pub async fn on_message(&self, message: &[u8]) -> Result<()> {
        let (_header, payload) = DiskChunkHeader::split(message)?;

        let mut guard = self.current.lock().await;
        let Some((pending, buf)) = guard.as_mut() else {
            tracing::warn!("Disk channel message with no pending read, dropping");
            return Ok(());
        };

        buf.extend_from_slice(payload);
        let wanted = (pending.end - pending.start) as usize;
        if buf.len() >= wanted {
            let (pending, buf) = guard.take().unwrap();
            let _ = pending.reply.send(buf);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn webrtc_backend_accumulates_across_messages() {
        let (backend, handle) = WebRtcBackend::new(4096, |_start, _end| {});

        let read_task = tokio::spawn(async move { backend.read_at(0, 10).await.unwrap() });
        tokio::task::yield_now().await;

        let header = DiskChunkHeader::new(0, 6);
        handle.on_message(&header.serialize_with_payload(&[1, 2, 3, 4, 5, 6])).await.unwrap();
        let header2 = DiskChunkHeader::new(6, 4);
        handle.on_message(&header2.serialize_with_payload(&[7, 8, 9, 10])).await.unwrap();

        let data = read_task.await.unwrap();
        assert_eq!(data, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }
}
