//! WebRTC peer connection wrapper. Generalizes the WebRTC plumbing of a
//! single-purpose remote-desktop agent into the multi-channel shape this
//! daemon needs: one H.264 video track plus named data channels (`rpc`,
//! `hid`, `disk`, `terminal`, and `upload_*`) dispatched to independent
//! callbacks instead of a single input-event sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

static PEER_GENERATION: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

pub type SharedPeer = Arc<RwLock<Arc<KvmPeer>>>;

type LabelCallback = Arc<dyn Fn(Arc<RTCDataChannel>) + Send + Sync>;

/// A single WebRTC peer connection, carrying the video track and whatever
/// data channels the browser opens on it. Unlike a one-purpose remote input
/// agent, this daemon dispatches opened channels by label rather than
/// assuming a single fixed channel.
pub struct KvmPeer {
    peer_connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    ice_gathering_complete: Arc<Notify>,
    state_rx: watch::Receiver<RTCPeerConnectionState>,
    pub generation: u64,
}

impl KvmPeer {
    pub async fn new(ice_servers: Vec<IceServerConfig>) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();

        // Only H.264 is ever registered. register_default_codecs() would
        // also offer VP8/VP9/AV1, and since the native bridge only ever
        // produces H.264 NAL units, letting the browser negotiate a
        // different codec would silently produce a black video track.
        let h264_feedback = vec![
            RTCPFeedback { typ: "goog-remb".into(), parameter: "".into() },
            RTCPFeedback { typ: "ccm".into(), parameter: "fir".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "pli".into() },
            RTCPFeedback { typ: "transport-cc".into(), parameter: "".into() },
        ];
        let fmtp = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: fmtp.to_string(),
                    rtcp_feedback: h264_feedback,
                },
                payload_type: 125,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_ice_servers: Vec<RTCIceServer> = if ice_servers.is_empty() {
            vec![RTCIceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                ..Default::default()
            }]
        } else {
            ice_servers
                .into_iter()
                .map(|s| RTCIceServer {
                    urls: s.urls,
                    username: s.username.unwrap_or_default(),
                    credential: s.credential.unwrap_or_default(),
                })
                .collect()
        };

        let config = RTCConfiguration { ice_servers: rtc_ice_servers, ..Default::default() };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: fmtp.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "kvm".to_string(),
        ));
        peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("failed to add video track")?;

        // Peer connection failures recover from a fresh SDP offer rather
        // than being torn down here — the session state machine watching
        // `state_rx` decides whether a Failed state should close the session.
        let (state_tx, state_rx) = watch::channel(RTCPeerConnectionState::New);
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!("Peer connection failed"),
                RTCPeerConnectionState::Disconnected => warn!("Peer connection disconnected"),
                _ => info!(?state, "Peer connection state changed"),
            }
            let _ = state_tx.send(state);
            Box::pin(async {})
        }));

        let ice_gathering_complete = Arc::new(Notify::new());
        let notify = Arc::clone(&ice_gathering_complete);
        peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
            if state == RTCIceGathererState::Complete {
                notify.notify_waiters();
            }
            Box::pin(async {})
        }));

        let generation = PEER_GENERATION.fetch_add(1, Ordering::Relaxed) + 1;
        info!(generation, "WebRTC peer connection created");

        Ok(Self { peer_connection, video_track, ice_gathering_complete, state_rx, generation })
    }

    /// Subscribe to connection-state transitions. Used by the session state
    /// machine to force-close on `Failed` without this module needing to
    /// know anything about sessions.
    pub fn watch_state(&self) -> watch::Receiver<RTCPeerConnectionState> {
        self.state_rx.clone()
    }

    /// Set the remote offer, create and set the local answer, then block
    /// until ICE gathering finishes so the returned SDP carries every local
    /// candidate — this daemon's signaling path is non-trickle outbound,
    /// even though inbound candidates from the browser are still trickled
    /// in separately via `add_ice_candidate`.
    pub async fn exchange_offer(&self, sdp_base64: &str) -> anyhow::Result<String> {
        let sdp = String::from_utf8(
            base64::engine::general_purpose::STANDARD
                .decode(sdp_base64)
                .context("offer is not valid base64")?,
        )
        .context("offer is not valid UTF-8")?;

        debug!(len = sdp.len(), "Received SDP offer");
        let offer = RTCSessionDescription::offer(sdp).context("failed to parse SDP offer")?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("failed to set remote description")?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("failed to create answer")?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .context("failed to set local description")?;

        if self.peer_connection.ice_gathering_state() != RTCIceGathererState::Complete {
            tokio::time::timeout(Duration::from_secs(10), self.ice_gathering_complete.notified())
                .await
                .context("timed out waiting for ICE gathering to complete")?;
        }

        let local = self
            .peer_connection
            .local_description()
            .await
            .context("no local description after gathering completed")?;

        Ok(base64::engine::general_purpose::STANDARD.encode(local.sdp.as_bytes()))
    }

    pub async fn add_ice_candidate(&self, candidate: &str) -> anyhow::Result<()> {
        if candidate.is_empty() {
            return Ok(());
        }
        let init = RTCIceCandidateInit { candidate: candidate.to_string(), ..Default::default() };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("failed to add ICE candidate")
    }

    pub async fn write_video_sample(&self, data: Vec<u8>, duration: Duration) -> anyhow::Result<()> {
        self.video_track
            .write_sample(&webrtc::media::Sample {
                data: bytes::Bytes::from(data),
                duration,
                ..Default::default()
            })
            .await
            .context("failed to write video sample")
    }

    pub fn is_connected(&self) -> bool {
        self.peer_connection.connection_state() == RTCPeerConnectionState::Connected
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.peer_connection.close().await.context("failed to close peer connection")?;
        info!("Peer connection closed");
        Ok(())
    }

    /// Register dispatch for data channels as they open, keyed by exact
    /// label or, for uploads, by the `upload_` prefix.
    pub fn on_data_channel(&self, dispatch: DataChannelDispatch) {
        self.peer_connection.on_data_channel(Box::new(move |dc| {
            let dispatch = dispatch.clone();
            Box::pin(async move {
                let label = dc.label().to_string();
                if let Some(cb) = dispatch.exact.get(&label) {
                    info!(%label, "Data channel opened");
                    cb(Arc::clone(&dc));
                } else if label.starts_with("upload_") {
                    info!(%label, "Upload data channel opened");
                    (dispatch.upload_prefix)(Arc::clone(&dc));
                } else {
                    warn!(%label, "Unknown data channel label, ignoring");
                }
            })
        }));
    }
}

/// Label-keyed routing table for opened data channels, built once per peer
/// and shared by clone into the `on_data_channel` closure.
#[derive(Clone)]
pub struct DataChannelDispatch {
    exact: HashMap<String, LabelCallback>,
    upload_prefix: LabelCallback,
}

pub struct DataChannelDispatchBuilder {
    exact: HashMap<String, LabelCallback>,
    upload_prefix: Option<LabelCallback>,
}

impl DataChannelDispatchBuilder {
    pub fn new() -> Self {
        Self { exact: HashMap::new(), upload_prefix: None }
    }

    pub fn on(mut self, label: &str, cb: impl Fn(Arc<RTCDataChannel>) + Send + Sync + 'static) -> Self {
        self.exact.insert(label.to_string(), Arc::new(cb));
        self
    }

    pub fn on_upload(mut self, cb: impl Fn(Arc<RTCDataChannel>) + Send + Sync + 'static) -> Self {
        self.upload_prefix = Some(Arc::new(cb));
        self
    }

    pub fn build(self) -> DataChannelDispatch {
        DataChannelDispatch {
            exact: self.exact,
            upload_prefix: self.upload_prefix.unwrap_or_else(|| Arc::new(|_| {})),
        }
    }
}

impl Default for DataChannelDispatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a new peer with ICE candidates relayed to `on_local_candidate` and
/// opened data channels routed by `dispatch`.
pub async fn create_peer(
    ice_servers: Vec<IceServerConfig>,
    on_local_candidate: impl Fn(String) + Send + Sync + 'static,
    dispatch: DataChannelDispatch,
) -> anyhow::Result<Arc<KvmPeer>> {
    let peer = Arc::new(KvmPeer::new(ice_servers).await.context("failed to create WebRTC peer")?);

    let pc = Arc::clone(&peer.peer_connection);
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            if let Ok(json) = c.to_json() {
                on_local_candidate(json.candidate);
            }
        }
        Box::pin(async {})
    }));

    peer.on_data_channel(dispatch);

    Ok(peer)
}

pub async fn snapshot(shared: &SharedPeer) -> Arc<KvmPeer> {
    Arc::clone(&*shared.read().await)
}

pub async fn snapshot_with_gen(shared: &SharedPeer) -> (Arc<KvmPeer>, u64) {
    let peer = snapshot(shared).await;
    let generation = peer.generation;
    (peer, generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn dispatch_builder_routes_exact_labels() {
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = Arc::clone(&seen);
        let dispatch = DataChannelDispatchBuilder::new()
            .on("rpc", move |_dc| seen2.store(true, Ordering::Relaxed))
            .build();
        assert!(dispatch.exact.contains_key("rpc"));
        assert!(!dispatch.exact.contains_key("hid"));
    }

    #[test]
    fn dispatch_builder_default_upload_handler_is_noop() {
        let dispatch = DataChannelDispatchBuilder::new().build();
        // upload_prefix always present even if unset, so callers never need
        // an Option check before invoking it.
        let _ = &dispatch.upload_prefix;
    }
}
