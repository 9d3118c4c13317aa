//! Virtual Media Engine (C5): owns the `VirtualMediaState` and the NBD
//! device it binds to, plus in-flight storage uploads. At most one mount
//! exists at a time; mounting selects one of three `DiskBackend`s
//! (`disk_backend.rs`) and hands it to `nbd.rs`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::disk_backend::{DiskBackend, HttpBackend, StorageBackend, WebRtcBackend, WebRtcBackendHandle};
use crate::nbd::NbdDevice;

const NBD_DEVICE_PATH: &str = "/dev/nbd0";
const GADGET_LUN_FILE: &str = "/sys/kernel/config/usb_gadget/kvmd/functions/mass_storage.usb0/lun.0/file";
const GADGET_CDROM_FLAG: &str = "/sys/kernel/config/usb_gadget/kvmd/functions/mass_storage.usb0/lun.0/cdrom";
const UPLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    WebRtc,
    Http,
    Storage,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaMode {
    Cdrom,
    Disk,
}

#[derive(Debug, Clone, Serialize)]
pub struct VirtualMediaState {
    pub source: MediaSource,
    pub mode: MediaMode,
    pub filename: Option<String>,
    pub url: Option<String>,
    pub size_bytes: u64,
}

/// Rejects absolute paths and `..` components; returns the basename of the
/// lexically-cleaned path.
pub fn sanitize_filename(raw: &str) -> Result<String> {
    let path = Path::new(raw);
    if path.is_absolute() {
        bail!("filename must not be absolute: {raw}");
    }
    for component in path.components() {
        if matches!(component, std::path::Component::ParentDir) {
            bail!("filename must not contain '..' components: {raw}");
        }
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("filename has no basename: {raw}"))?;
    Ok(name.to_string())
}

struct PendingUpload {
    file: tokio::fs::File,
    incomplete_path: PathBuf,
    final_path: PathBuf,
    declared_size: u64,
    bytes_written: u64,
    last_progress_sent: Instant,
}

pub struct VirtualMediaEngine {
    images_dir: PathBuf,
    state: Mutex<Option<VirtualMediaState>>,
    nbd: Mutex<Option<NbdDevice>>,
    webrtc_handle: Mutex<Option<WebRtcBackendHandle>>,
    uploads: Mutex<std::collections::HashMap<Uuid, PendingUpload>>,
    http_client: reqwest::Client,
    /// The currently-open "disk" data channel, if any. Stashed here (rather
    /// than threaded through the RPC layer) so `mountWithWebRTC` can build
    /// its `{start,end}` request sender without the session manager needing
    /// to know anything about virtual media.
    disk_channel: Mutex<Option<Arc<RTCDataChannel>>>,
}

pub struct StartUploadResult {
    pub already_uploaded_bytes: u64,
    pub data_channel: String,
}

impl VirtualMediaEngine {
    pub fn new(images_dir: PathBuf, http_client: reqwest::Client) -> Arc<Self> {
        Arc::new(Self {
            images_dir,
            state: Mutex::new(None),
            nbd: Mutex::new(None),
            webrtc_handle: Mutex::new(None),
            uploads: Mutex::new(std::collections::HashMap::new()),
            http_client,
            disk_channel: Mutex::new(None),
        })
    }

    /// Wires the "disk" data channel (§4.4): stashes it for `mountWithWebRTC`
    /// to send `{start,end}` requests on, and forwards every binary message
    /// it carries to whichever `WebRtcBackend` is currently mounted.
    pub async fn bind_disk_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        *self.disk_channel.lock().await = Some(Arc::clone(&dc));

        let engine = Arc::clone(self);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                if msg.is_string {
                    return;
                }
                if let Err(e) = engine.on_disk_channel_message(&msg.data).await {
                    tracing::warn!(error = %e, "Failed to process disk channel message");
                }
            })
        }))
        .await;

        let engine_for_close = Arc::clone(self);
        dc.on_close(Box::new(move || {
            let engine = Arc::clone(&engine_for_close);
            Box::pin(async move {
                *engine.disk_channel.lock().await = None;
            })
        }))
        .await;
    }

    /// `mountWithWebRTC` RPC entry point: builds the `send_request` closure
    /// from whichever "disk" channel `bind_disk_channel` already stored.
    pub async fn mount_webrtc_on_bound_channel(&self, size_bytes: u64, mode: MediaMode) -> Result<()> {
        let dc = self.disk_channel.lock().await.clone().context("disk data channel is not open yet")?;
        self.mount_webrtc(size_bytes, mode, move |start, end| {
            let dc = Arc::clone(&dc);
            tokio::spawn(async move {
                let request = serde_json::json!({ "start": start, "end": end }).to_string();
                if let Err(e) = dc.send_text(request).await {
                    tracing::warn!(error = %e, "Failed to send disk read request");
                }
            });
        })
        .await
    }

    pub async fn current_state(&self) -> Option<VirtualMediaState> {
        self.state.lock().await.clone()
    }

    pub async fn mount_storage(&self, filename: &str, mode: MediaMode) -> Result<()> {
        let name = sanitize_filename(filename)?;
        let path = self.images_dir.join(&name);
        let backend = StorageBackend::open(path).await?;
        let size = backend.size();
        self.mount(Arc::new(backend), MediaSource::Storage, mode, Some(name), None, size)
            .await
    }

    pub async fn mount_http(&self, url: &str, mode: MediaMode) -> Result<()> {
        let backend = HttpBackend::probe(self.http_client.clone(), url.to_string()).await?;
        let size = backend.size();
        self.mount(Arc::new(backend), MediaSource::Http, mode, None, Some(url.to_string()), size)
            .await
    }

    /// `send_request` pushes a `{start,end}` JSON text frame to the browser
    /// over the already-open "disk" data channel.
    pub async fn mount_webrtc(
        &self,
        size_bytes: u64,
        mode: MediaMode,
        send_request: impl Fn(u64, u64) + Send + Sync + 'static,
    ) -> Result<()> {
        let (backend, handle) = WebRtcBackend::new(size_bytes, send_request);
        *self.webrtc_handle.lock().await = Some(handle);
        self.mount(Arc::new(backend), MediaSource::WebRtc, mode, None, None, size_bytes).await
    }

    /// Feeds a binary message received on the "disk" data channel to the
    /// active WebRTC backend, if one is mounted.
    pub async fn on_disk_channel_message(&self, message: &[u8]) -> Result<()> {
        let guard = self.webrtc_handle.lock().await;
        let Some(handle) = guard.as_ref() else {
            bail!("no WebRTC backend mounted");
        };
        handle.on_message(message).await
    }

    async fn mount(
        &self,
        backend: Arc<dyn DiskBackend>,
        source: MediaSource,
        mode: MediaMode,
        filename: Option<String>,
        url: Option<String>,
        size_bytes: u64,
    ) -> Result<()> {
        let mut state_guard = self.state.lock().await;
        if state_guard.is_some() {
            bail!("already mounted");
        }

        let nbd = NbdDevice::mount(NBD_DEVICE_PATH, backend)
            .await
            .context("failed to bind NBD device")?;

        write_gadget_attr(GADGET_CDROM_FLAG, if mode == MediaMode::Cdrom { "1" } else { "0" })
            .await
            .context("failed to set gadget cdrom flag")?;
        write_gadget_attr(GADGET_LUN_FILE, NBD_DEVICE_PATH)
            .await
            .context("failed to point gadget lun at NBD device")?;

        *self.nbd.lock().await = Some(nbd);
        *state_guard = Some(VirtualMediaState { source, mode, filename, url, size_bytes });
        Ok(())
    }

    /// Clear the mass-storage backing file, let the kernel release it, close
    /// the NBD device, then clear state — in that order, per the engine's
    /// teardown invariant.
    pub async fn unmount(&self) -> Result<()> {
        let mut state_guard = self.state.lock().await;
        if state_guard.is_none() {
            return Ok(());
        }

        let _ = write_gadget_attr(GADGET_LUN_FILE, "").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        if let Some(nbd) = self.nbd.lock().await.take() {
            nbd.disconnect().await?;
        }
        *self.webrtc_handle.lock().await = None;
        *state_guard = None;
        Ok(())
    }

    pub async fn start_upload(&self, filename: &str, size: u64) -> Result<StartUploadResult> {
        let name = sanitize_filename(filename)?;
        let final_path = self.images_dir.join(&name);
        let incomplete_path = self.images_dir.join(format!("{name}.incomplete"));

        let already_uploaded_bytes = match tokio::fs::metadata(&incomplete_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(true)
            .open(&incomplete_path)
            .await
            .with_context(|| format!("failed to open {}", incomplete_path.display()))?;

        let upload_id = Uuid::new_v4();
        self.uploads.lock().await.insert(
            upload_id,
            PendingUpload {
                file,
                incomplete_path,
                final_path,
                declared_size: size,
                bytes_written: already_uploaded_bytes,
                last_progress_sent: Instant::now() - UPLOAD_PROGRESS_INTERVAL,
            },
        );

        Ok(StartUploadResult { already_uploaded_bytes, data_channel: format!("upload_{upload_id}") })
    }

    /// Appends `chunk` to the named upload. Returns `Some(progress fraction)`
    /// when enough time has passed since the last progress emission (or the
    /// upload just completed) so the caller can notify the browser;
    /// `None` otherwise.
    pub async fn write_upload_chunk(&self, upload_id: Uuid, chunk: &[u8]) -> Result<Option<UploadProgress>> {
        let mut uploads = self.uploads.lock().await;
        let upload = uploads.get_mut(&upload_id).ok_or_else(|| anyhow::anyhow!("unknown upload {upload_id}"))?;

        upload.file.write_all(chunk).await.context("failed to write upload chunk")?;
        upload.bytes_written += chunk.len() as u64;

        let complete = upload.bytes_written >= upload.declared_size;
        let should_emit = complete || upload.last_progress_sent.elapsed() >= UPLOAD_PROGRESS_INTERVAL;

        if complete {
            upload.file.flush().await.ok();
            tokio::fs::rename(&upload.incomplete_path, &upload.final_path)
                .await
                .with_context(|| format!("failed to finalize upload {upload_id}"))?;
            let progress = UploadProgress { bytes_written: upload.bytes_written, declared_size: upload.declared_size, complete: true };
            uploads.remove(&upload_id);
            return Ok(Some(progress));
        }

        if should_emit {
            upload.last_progress_sent = Instant::now();
            return Ok(Some(UploadProgress {
                bytes_written: upload.bytes_written,
                declared_size: upload.declared_size,
                complete: false,
            }));
        }

        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct UploadProgress {
    pub bytes_written: u64,
    pub declared_size: u64,
    pub complete: bool,
}

static GADGET_WRITES_DISABLED_WARNED: AtomicU64 = AtomicU64::new(0);

async fn write_gadget_attr(path: &str, value: &str) -> Result<()> {
    match tokio::fs::write(path, value).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if GADGET_WRITES_DISABLED_WARNED.fetch_add(1, Ordering::Relaxed) == 0 {
                tracing::warn!(path, "USB gadget sysfs attribute not present, skipping write");
            }
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("failed to write {path}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filename_accepts_plain_name() {
        assert_eq!(sanitize_filename("ubuntu.iso").unwrap(), "ubuntu.iso");
    }

    #[test]
    fn sanitize_filename_rejects_absolute_path() {
        assert!(sanitize_filename("/etc/passwd").is_err());
    }

    #[test]
    fn sanitize_filename_rejects_parent_dir_component() {
        assert!(sanitize_filename("../../etc/passwd").is_err());
    }

    #[test]
    fn sanitize_filename_takes_basename_of_nested_path() {
        assert_eq!(sanitize_filename("images/sub/disk.img").unwrap(), "disk.img");
    }

    #[tokio::test]
    async fn start_upload_reports_zero_already_uploaded_for_new_file() {
        let dir = tempdir();
        let engine = VirtualMediaEngine::new(dir.clone(), reqwest::Client::new());
        let result = engine.start_upload("new.img", 1024).await.unwrap();
        assert_eq!(result.already_uploaded_bytes, 0);
        assert!(result.data_channel.starts_with("upload_"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn write_upload_chunk_completes_and_renames_on_full_size() {
        let dir = tempdir();
        let engine = VirtualMediaEngine::new(dir.clone(), reqwest::Client::new());
        let result = engine.start_upload("done.img", 4).await.unwrap();
        let upload_id: Uuid = result.data_channel.strip_prefix("upload_").unwrap().parse().unwrap();

        let progress = engine.write_upload_chunk(upload_id, &[1, 2, 3, 4]).await.unwrap().unwrap();
        assert!(progress.complete);
        assert!(dir.join("done.img").exists());
        assert!(!dir.join("done.img.incomplete").exists());
        std::fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kvmd-vmedia-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
