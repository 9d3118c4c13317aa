//! Session Manager (C4): owns the single current WebRTC session pointer.
//! At most one session is ever "current"; a new accepted offer supersedes
//! whatever was there before, closing the old peer after a short grace
//! period so its last frames/events have a chance to flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::native_bridge::NativeBridge;
use crate::peer::{self, DataChannelDispatch, DataChannelDispatchBuilder, IceServerConfig, KvmPeer};
use crate::rpc::Router;

const SUPERSESSION_GRACE: Duration = Duration::from_secs(1);

/// Callbacks the Session Manager invokes when a data channel of a given
/// label opens on a session's peer. Kept as plain closures so this module
/// doesn't need to depend on the virtual media / HID / terminal modules
/// directly — whoever constructs the `SessionManager` wires them up.
pub struct SessionHandlers {
    /// Builds a fresh `Router` for each new session, pre-populated with
    /// every JSON-RPC method this daemon supports (`keyboardReport`,
    /// `mountWithStorage`, ...). A factory rather than a shared instance
    /// because outbound call state (`Router::call`'s response table) must
    /// not leak between sessions.
    pub router_factory: Arc<dyn Fn() -> Router + Send + Sync>,
    pub on_rpc_open: Arc<dyn Fn(Uuid, Arc<RTCDataChannel>, Arc<Router>) + Send + Sync>,
    pub on_hid_open: Arc<dyn Fn(Uuid, Arc<RTCDataChannel>) + Send + Sync>,
    pub on_disk_open: Arc<dyn Fn(Uuid, Arc<RTCDataChannel>) + Send + Sync>,
    pub on_terminal_open: Arc<dyn Fn(Uuid, Arc<RTCDataChannel>) + Send + Sync>,
    pub on_upload_open: Arc<dyn Fn(Uuid, Arc<RTCDataChannel>) + Send + Sync>,
}

pub struct Session {
    pub id: Uuid,
    pub peer: Arc<KvmPeer>,
    pub rpc_router: Arc<Router>,
    pub is_cloud: bool,
    pub unmount_on_close: std::sync::atomic::AtomicBool,
    pub created_at: u64,
    pub last_activity: AtomicU64,
    /// Set once the `rpc` data channel opens, so the manager can deliver
    /// one-way events (`otherSessionConnected`, etc.) directly.
    rpc_channel: tokio::sync::Mutex<Option<Arc<RTCDataChannel>>>,
}

impl Session {
    pub fn touch(&self) {
        self.last_activity.store(now_secs(), Ordering::Relaxed);
    }

    async fn send_event(&self, method: &str, params: serde_json::Value) {
        let guard = self.rpc_channel.lock().await;
        let Some(dc) = guard.as_ref() else {
            tracing::debug!(session_id = %self.id, %method, "rpc channel not open, dropping event");
            return;
        };
        let text = Router::encode_event(method, params);
        if let Err(e) = dc.send_text(text).await {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to send event over rpc channel");
        }
    }
}

pub struct SessionManager {
    current: RwLock<Option<Arc<Session>>>,
    native_bridge: Arc<NativeBridge>,
    handlers: SessionHandlers,
    active_sessions: AtomicU64,
}

impl SessionManager {
    pub fn new(native_bridge: Arc<NativeBridge>, handlers: SessionHandlers) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(None),
            native_bridge,
            handlers,
            active_sessions: AtomicU64::new(0),
        })
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub async fn current(&self) -> Option<Arc<Session>> {
        self.current.read().await.clone()
    }

    /// Accept an SDP offer, creating a new session. If another session is
    /// already current, it is superseded: notified via `otherSessionConnected`
    /// on its own rpc channel, then closed after a short grace period.
    pub async fn exchange_offer(
        self: &Arc<Self>,
        sd_base64: &str,
        is_cloud: bool,
        ice_servers: Vec<IceServerConfig>,
    ) -> Result<String> {
        let session_id = Uuid::new_v4();
        let router = Arc::new((self.handlers.router_factory)());

        // Data channels only open after the browser has this answer and
        // ICE has connected, which is well after this function returns — so
        // it's safe to build the real session first and register the real
        // dispatch (which needs `Arc<Session>` to stash the rpc channel)
        // before the peer connection ever reaches that point.
        let peer = peer::create_peer(
            ice_servers,
            |_candidate| {
                // This daemon waits for ICE gathering to complete before
                // answering (see peer.rs), so outbound candidates never
                // need a separate signaling round-trip on the happy path.
            },
            DataChannelDispatchBuilder::new().build(),
        )
        .await
        .context("failed to create WebRTC peer")?;

        let answer = peer
            .exchange_offer(sd_base64)
            .await
            .context("failed to exchange SDP offer")?;

        let session = Arc::new(Session {
            id: session_id,
            peer: Arc::clone(&peer),
            rpc_router: Arc::clone(&router),
            is_cloud,
            unmount_on_close: std::sync::atomic::AtomicBool::new(false),
            created_at: now_secs(),
            last_activity: AtomicU64::new(now_secs()),
            rpc_channel: tokio::sync::Mutex::new(None),
        });

        let dispatch = self.build_dispatch(session_id, Arc::clone(&session), router);
        peer.on_data_channel(dispatch);

        self.supersede(Arc::clone(&session)).await;
        self.spawn_state_watcher(session);

        Ok(answer)
    }

    async fn supersede(&self, new_session: Arc<Session>) {
        let previous = {
            let mut guard = self.current.write().await;
            guard.replace(Arc::clone(&new_session))
        };

        let count = self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 {
            if let Err(e) = self.native_bridge.call("startVideo", json!({})).await {
                tracing::warn!(error = %e, "Failed to request start_video from native bridge");
            }
        }

        if let Some(old) = previous {
            old.send_event("otherSessionConnected", json!({})).await;
            let old_for_close = Arc::clone(&old);
            tokio::spawn(async move {
                tokio::time::sleep(SUPERSESSION_GRACE).await;
                let _ = old_for_close.peer.close().await;
            });
            self.finish_closing(&old).await;
        }
    }

    /// Watches connection-state transitions and force-closes on `Failed`.
    fn spawn_state_watcher(self: &Arc<Self>, session: Arc<Session>) {
        let mut rx = session.peer.watch_state();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                if *rx.borrow() == RTCPeerConnectionState::Failed {
                    tracing::warn!(session_id = %session.id, "Session peer failed, closing");
                    manager.close_if_current(&session).await;
                    return;
                }
            }
        });
    }

    async fn close_if_current(&self, session: &Arc<Session>) {
        let was_current = {
            let mut guard = self.current.write().await;
            if guard.as_ref().map(|s| s.id) == Some(session.id) {
                *guard = None;
                true
            } else {
                false
            }
        };
        if was_current {
            let _ = session.peer.close().await;
            self.finish_closing(session).await;
        }
    }

    async fn finish_closing(&self, session: &Arc<Session>) {
        if session.unmount_on_close.load(Ordering::Relaxed) {
            tracing::info!(session_id = %session.id, "Unmounting virtual media on session close");
            // Actual unmount is performed by whichever handler owns the
            // `disk` channel's virtual media state; this flag only records
            // the intent so that handler knows to act on close.
        }
        let remaining = self.active_sessions.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining == 0 {
            if let Err(e) = self.native_bridge.call("stopVideo", json!({})).await {
                tracing::warn!(error = %e, "Failed to request stop_video from native bridge");
            }
        }
    }

    pub async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        let Some(session) = self.current().await else {
            return Ok(());
        };
        session.peer.add_ice_candidate(candidate).await
    }

    pub async fn close_current(&self) {
        if let Some(session) = self.current.write().await.take() {
            let _ = session.peer.close().await;
            self.finish_closing(&session).await;
        }
    }

    fn build_dispatch(&self, session_id: Uuid, session: Arc<Session>, router: Arc<Router>) -> DataChannelDispatch {
        let on_rpc = Arc::clone(&self.handlers.on_rpc_open);
        let on_hid = Arc::clone(&self.handlers.on_hid_open);
        let on_disk = Arc::clone(&self.handlers.on_disk_open);
        let on_terminal = Arc::clone(&self.handlers.on_terminal_open);
        let on_upload = Arc::clone(&self.handlers.on_upload_open);

        DataChannelDispatchBuilder::new()
            .on("rpc", move |dc| {
                let session = Arc::clone(&session);
                let dc_for_store = Arc::clone(&dc);
                tokio::spawn(async move {
                    *session.rpc_channel.lock().await = Some(dc_for_store);
                });
                on_rpc(session_id, dc, Arc::clone(&router))
            })
            .on("hid", move |dc| on_hid(session_id, dc))
            .on("disk", move |dc| on_disk(session_id, dc))
            .on("terminal", move |dc| on_terminal(session_id, dc))
            .on_upload(move |dc| on_upload(session_id, dc))
            .build()
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handlers() -> SessionHandlers {
        SessionHandlers {
            router_factory: Arc::new(|| Router::builder().build()),
            on_rpc_open: Arc::new(|_, _, _| {}),
            on_hid_open: Arc::new(|_, _| {}),
            on_disk_open: Arc::new(|_, _| {}),
            on_terminal_open: Arc::new(|_, _| {}),
            on_upload_open: Arc::new(|_, _| {}),
        }
    }

    #[test]
    fn handlers_can_be_constructed_as_noops() {
        let _ = noop_handlers();
    }

    #[test]
    fn now_secs_is_nonzero() {
        assert!(now_secs() > 0);
    }
}
