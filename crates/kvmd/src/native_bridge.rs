//! Native Bridge (C1): owns the subprocess that talks to the hardware (video
//! capture, EDID, GPIO) and the two `SOCK_SEQPACKET` sockets it connects back
//! on. This module verifies the embedded binary's checksum before launch,
//! supervises it with exponential backoff, and exposes a request/response API
//! over the control socket plus a broadcast of decoded video frames.

use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

pub const CONTROL_SOCKET_PATH: &str = "/var/run/kvmd-ctrl.sock";
pub const VIDEO_SOCKET_PATH: &str = "/var/run/kvmd-video.sock";

/// Max NAL payload we'll accept off the video socket: 1920x1080 at worst-case
/// 0.5 bytes/pixel, matching the bridge's own frame budget.
const MAX_VIDEO_FRAME_SIZE: usize = 1920 * 1080 / 2;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESTARTS_PER_WINDOW: u32 = 6;
const RESTART_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
struct CtrlOutbound<'a> {
    action: &'a str,
    seq: u64,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CtrlInbound {
    Reply {
        seq: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        errno: Option<i32>,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CtrlError {
    #[error("native bridge returned error: {0}")]
    Remote(String),
    #[error("native bridge syscall failed, errno {0}")]
    Errno(i32),
    #[error("request timed out waiting for native bridge reply")]
    Timeout,
    #[error("control socket not connected")]
    NotConnected,
}

struct PendingSlot {
    tx: oneshot::Sender<Result<Value, CtrlError>>,
}

/// Owns the control socket's sequence counter and the table of in-flight
/// request waiters, keyed by sequence number. Only the Native Bridge ever
/// writes to the control socket.
struct PendingRequests {
    next_seq: AtomicU64,
    slots: Mutex<std::collections::HashMap<u64, PendingSlot>>,
}

impl PendingRequests {
    fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(1),
            slots: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn next(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn register(&self, seq: u64) -> oneshot::Receiver<Result<Value, CtrlError>> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().await.insert(seq, PendingSlot { tx });
        rx
    }

    async fn complete(&self, seq: u64, result: Result<Value, CtrlError>) {
        if let Some(slot) = self.slots.lock().await.remove(&seq) {
            let _ = slot.tx.send(result);
        }
    }

    async fn evict(&self, seq: u64) {
        self.slots.lock().await.remove(&seq);
    }
}

/// Handle to the native bridge, shared by the JSON-RPC router and anything
/// else that needs to issue control requests or watch video frames.
pub struct NativeBridge {
    write_half: Mutex<Option<tokio::net::unix::OwnedWriteHalf>>,
    pending: Arc<PendingRequests>,
    video_tx: broadcast::Sender<Bytes>,
    degraded: std::sync::atomic::AtomicBool,
}

impl NativeBridge {
    /// Send a control request and await its reply, or time out after 5s.
    pub async fn call(&self, action: &str, params: Value) -> Result<Value, CtrlError> {
        let seq = self.pending.next();
        let rx = self.pending.register(seq).await;

        let msg = CtrlOutbound { action, seq, params };
        let mut line = serde_json::to_vec(&msg).map_err(|e| CtrlError::Remote(e.to_string()))?;
        line.push(b'\n');

        {
            let mut guard = self.write_half.lock().await;
            let Some(writer) = guard.as_mut() else {
                self.pending.evict(seq).await;
                return Err(CtrlError::NotConnected);
            };
            use tokio::io::AsyncWriteExt;
            if writer.write_all(&line).await.is_err() {
                *guard = None;
                self.pending.evict(seq).await;
                return Err(CtrlError::NotConnected);
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CtrlError::NotConnected),
            Err(_) => {
                self.pending.evict(seq).await;
                Err(CtrlError::Timeout)
            }
        }
    }

    pub fn subscribe_video(&self) -> broadcast::Receiver<Bytes> {
        self.video_tx.subscribe()
    }

    /// True once restart attempts have been exhausted; the bridge keeps the
    /// daemon alive in a degraded state rather than treating this as fatal.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

/// Verify the embedded native binary's SHA-256 checksum against `expected`,
/// and atomically replace the installed copy at `dest` if it differs (so a
/// daemon upgrade also upgrades its companion binary).
pub fn verify_and_install(embedded: &[u8], expected_sha256: &str, dest: &Path) -> Result<()> {
    let mut hasher = Sha256::new();
    hasher.update(embedded);
    let digest = to_hex(&hasher.finalize());

    let needs_install = match std::fs::read(dest) {
        Ok(existing) => {
            let mut h = Sha256::new();
            h.update(&existing);
            to_hex(&h.finalize()) != expected_sha256
        }
        Err(_) => true,
    };

    if digest != expected_sha256 {
        anyhow::bail!("embedded native binary checksum mismatch: got {digest}, expected {expected_sha256}");
    }

    if needs_install {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        if let Some(dir) = dest.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = dest.with_extension("tmp");
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o755)
            .open(&tmp)
            .with_context(|| format!("failed to open {}", tmp.display()))?;
        f.write_all(embedded)?;
        drop(f);
        std::fs::rename(&tmp, dest)
            .with_context(|| format!("failed to install native binary at {}", dest.display()))?;
        tracing::info!(path = %dest.display(), "Installed native bridge binary");
    }

    Ok(())
}

/// Launch the native bridge process and its socket listeners, returning the
/// shared handle immediately. Connection, control/video handling, and
/// respawn-on-exit supervision all run as background tasks under `token`.
pub fn spawn(binary_path: PathBuf, token: CancellationToken) -> Arc<NativeBridge> {
    let (video_tx, _) = broadcast::channel(8);
    let pending = Arc::new(PendingRequests::new());
    let bridge = Arc::new(NativeBridge {
        write_half: Mutex::new(None),
        pending: Arc::clone(&pending),
        video_tx,
        degraded: std::sync::atomic::AtomicBool::new(false),
    });

    let bridge_for_task = Arc::clone(&bridge);
    tokio::spawn(async move {
        supervise(binary_path, bridge_for_task, token).await;
    });

    bridge
}

async fn supervise(binary_path: PathBuf, bridge: Arc<NativeBridge>, token: CancellationToken) {
    let mut restarts_in_window = 0u32;
    let mut window_start = tokio::time::Instant::now();

    loop {
        if token.is_cancelled() {
            return;
        }

        if window_start.elapsed() > RESTART_WINDOW {
            restarts_in_window = 0;
            window_start = tokio::time::Instant::now();
        }

        if restarts_in_window >= MAX_RESTARTS_PER_WINDOW {
            tracing::error!("Native bridge exceeded restart budget, marking degraded");
            bridge.degraded.store(true, Ordering::Relaxed);
            tokio::select! {
                _ = tokio::time::sleep(RESTART_WINDOW) => continue,
                _ = token.cancelled() => return,
            }
        }

        match run_once(&binary_path, &bridge, token.clone()).await {
            Ok(()) => tracing::info!("Native bridge exited cleanly"),
            Err(e) => tracing::warn!(error = %e, "Native bridge session ended"),
        }

        if token.is_cancelled() {
            return;
        }

        let delay = Duration::from_secs(1u64 << restarts_in_window.min(5));
        restarts_in_window += 1;
        tracing::info!(delay_secs = delay.as_secs(), "Respawning native bridge after delay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => return,
        }
    }
}

async fn run_once(binary_path: &Path, bridge: &Arc<NativeBridge>, token: CancellationToken) -> Result<()> {
    let _ = std::fs::remove_file(CONTROL_SOCKET_PATH);
    let _ = std::fs::remove_file(VIDEO_SOCKET_PATH);

    let ctrl_listener = bind_seqpacket_listener(CONTROL_SOCKET_PATH)?;
    let video_listener = bind_seqpacket_listener(VIDEO_SOCKET_PATH)?;

    let mut child = tokio::process::Command::new(binary_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .with_context(|| format!("failed to spawn native bridge at {}", binary_path.display()))?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_to_log(stdout, "native.stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_to_log(stderr, "native.stderr"));
    }

    let accept_ctrl = tokio::time::timeout(Duration::from_secs(10), ctrl_listener.accept());
    let (ctrl_stream, _) = accept_ctrl
        .await
        .context("timed out waiting for native bridge to connect control socket")?
        .context("control socket accept failed")?;
    tracing::info!("Native bridge control socket connected");

    let (ctrl_read, ctrl_write) = ctrl_stream.into_split();
    *bridge.write_half.lock().await = Some(ctrl_write);

    let ctrl_pending = Arc::clone(&bridge.pending);
    let ctrl_task = tokio::spawn(read_control_loop(ctrl_read, ctrl_pending));

    let video_tx = bridge.video_tx.clone();
    let video_task = tokio::spawn(accept_video_loop(video_listener, video_tx));

    tokio::select! {
        status = child.wait() => {
            tracing::warn!(?status, "Native bridge process exited");
        }
        _ = ctrl_task => {
            tracing::warn!("Native bridge control socket closed");
        }
        _ = token.cancelled() => {
            let _ = child.start_kill();
        }
    }

    *bridge.write_half.lock().await = None;
    video_task.abort();
    let _ = child.kill().await;
    Ok(())
}

/// `std::os::unix::net::UnixListener::bind` always creates a `SOCK_STREAM`
/// socket, so the listener has to be built from nix's lower-level `socket`
/// + `bind` + `listen`, then handed to tokio by fd.
fn bind_seqpacket_listener(path: &str) -> Result<UnixSeqpacketListener> {
    use nix::sys::socket::{bind, listen, Backlog, UnixAddr};

    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_NONBLOCK,
        None,
    )
    .with_context(|| format!("failed to create SOCK_SEQPACKET socket for {path}"))?;

    let addr = UnixAddr::new(path).with_context(|| format!("invalid socket path {path}"))?;
    bind(fd.as_raw_fd(), &addr).with_context(|| format!("failed to bind {path}"))?;
    listen(&fd, Backlog::new(8).expect("valid backlog")).with_context(|| format!("failed to listen on {path}"))?;

    let std_listener = unsafe {
        use std::os::fd::{FromRawFd, IntoRawFd};
        StdUnixListener::from_raw_fd(fd.into_raw_fd())
    };
    std_listener
        .set_nonblocking(true)
        .context("failed to set control socket nonblocking")?;
    let listener = UnixListener::from_std(std_listener)
        .context("failed to adopt seqpacket listener into tokio runtime")?;
    Ok(UnixSeqpacketListener { inner: listener })
}

/// Thin seqpacket-flavored wrapper. `tokio::net::UnixListener` assumes
/// stream semantics for framing but accept()/fd passing behave identically
/// for SOCK_SEQPACKET, so we reuse it and treat each `read` as one datagram.
struct UnixSeqpacketListener {
    inner: UnixListener,
}

impl UnixSeqpacketListener {
    async fn accept(&self) -> std::io::Result<(tokio::net::UnixStream, std::os::unix::net::SocketAddr)> {
        self.inner.accept().await
    }
}

async fn read_control_loop(
    mut read_half: tokio::net::unix::OwnedReadHalf,
    pending: Arc<PendingRequests>,
) {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let Ok(msg) = serde_json::from_slice::<CtrlInbound>(&buf[..n]) else {
            tracing::warn!("Malformed control message from native bridge");
            continue;
        };
        match msg {
            CtrlInbound::Reply { seq, result, error, errno } => {
                let outcome = if let Some(err) = error {
                    Err(CtrlError::Remote(err))
                } else if let Some(errno) = errno {
                    Err(CtrlError::Errno(errno))
                } else {
                    Ok(result.unwrap_or(Value::Null))
                };
                pending.complete(seq, outcome).await;
            }
            CtrlInbound::Event { event, data } => {
                tracing::debug!(event = %event, ?data, "Native bridge event");
            }
        }
    }
}

async fn accept_video_loop(listener: UnixSeqpacketListener, video_tx: broadcast::Sender<Bytes>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "Video socket accept failed");
                return;
            }
        };
        let tx = video_tx.clone();
        tokio::spawn(read_video_loop(stream, tx));
    }
}

async fn read_video_loop(mut stream: tokio::net::UnixStream, video_tx: broadcast::Sender<Bytes>) {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; MAX_VIDEO_FRAME_SIZE];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        // Frames are dropped silently when nobody's subscribed (no active
        // session); `send` only fails when there are zero receivers.
        let _ = video_tx.send(Bytes::copy_from_slice(&buf[..n]));
    }
}

async fn drain_to_log(reader: impl tokio::io::AsyncRead + Unpin, target: &'static str) {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: target, "{line}");
    }
}

#[allow(unused)]
fn unused_raw_fd_help(_fd: RawFd) {}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").unwrap();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_outbound_serializes_expected_shape() {
        let msg = CtrlOutbound { action: "setEdid", seq: 1, params: serde_json::json!({"edid": "abc"}) };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"action\":\"setEdid\""));
        assert!(json.contains("\"seq\":1"));
    }

    #[test]
    fn verify_and_install_rejects_checksum_mismatch() {
        let dest = std::env::temp_dir().join("kvmd-native-bridge-test-binary");
        let result = verify_and_install(b"hello", "deadbeef", &dest);
        assert!(result.is_err());
    }

    #[test]
    fn verify_and_install_accepts_matching_checksum() {
        let dest = std::env::temp_dir().join(format!("kvmd-native-bridge-{}", uuid::Uuid::new_v4()));
        let mut hasher = Sha256::new();
        hasher.update(b"hello");
        let digest = to_hex(&hasher.finalize());
        verify_and_install(b"hello", &digest, &dest).unwrap();
        assert!(dest.exists());
        let _ = std::fs::remove_file(&dest);
    }

    #[tokio::test]
    async fn pending_requests_completes_registered_slot() {
        let pending = PendingRequests::new();
        let seq = pending.next();
        let rx = pending.register(seq).await;
        pending.complete(seq, Ok(Value::Bool(true))).await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Ok(Value::Bool(true))));
    }

    #[tokio::test]
    async fn pending_requests_eviction_drops_late_reply() {
        let pending = PendingRequests::new();
        let seq = pending.next();
        let _rx = pending.register(seq).await;
        pending.evict(seq).await;
        // completing after eviction should be a no-op, not a panic
        pending.complete(seq, Ok(Value::Null)).await;
    }
}
