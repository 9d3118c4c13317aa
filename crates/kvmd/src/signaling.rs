//! Signaling Transport (C3): the `{type, data}` WebSocket framing shared by
//! both the LAN direct path (`/webrtc/signaling`) and the cloud relay path
//! (`cloud.rs`). Only the outer socket type and authentication differ
//! between the two; the message shapes, offer dedup, and ping/RTT tracking
//! live here once.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use kvmd_protocol::{IceCandidateInit, WebRtcSessionRequest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const PING_INTERVAL: Duration = Duration::from_secs(15);
const PONG_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum InboundSignal {
    Offer(WebRtcSessionRequest),
    NewIceCandidate(IceCandidateInit),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum OutboundSignal {
    Answer(String),
    Error(ErrorPayload),
}

impl OutboundSignal {
    pub fn answer(sdp: String) -> Self {
        Self::Answer(sdp)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload { message: message.into() })
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","data":{"message":"encode failure"}}"#.to_string())
    }
}

/// One inbound unit off the wire, abstracted over the concrete socket type.
pub enum SignalFrame {
    Text(String),
    Pong(Vec<u8>),
    Close,
}

pub(crate) type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
pub(crate) type RecvFuture<'a> = Pin<Box<dyn Future<Output = Option<Result<SignalFrame>>> + Send + 'a>>;

/// Object-safe so `pump` doesn't need to be generic over both the axum
/// server-side socket and the tokio-tungstenite client-side stream.
pub trait SignalSocket: Send {
    fn send_text(&mut self, text: String) -> SendFuture<'_>;
    fn send_ping(&mut self, payload: Vec<u8>) -> SendFuture<'_>;
    fn recv_frame(&mut self) -> RecvFuture<'_>;
}

impl SignalSocket for axum::extract::ws::WebSocket {
    fn send_text(&mut self, text: String) -> SendFuture<'_> {
        Box::pin(async move { self.send(axum::extract::ws::Message::Text(text.into())).await.map_err(|e| anyhow!(e)) })
    }

    fn send_ping(&mut self, payload: Vec<u8>) -> SendFuture<'_> {
        Box::pin(async move { self.send(axum::extract::ws::Message::Ping(payload.into())).await.map_err(|e| anyhow!(e)) })
    }

    fn recv_frame(&mut self) -> RecvFuture<'_> {
        Box::pin(async move {
            match StreamExt::next(self).await {
                None => None,
                Some(Ok(axum::extract::ws::Message::Text(t))) => Some(Ok(SignalFrame::Text(t.to_string()))),
                Some(Ok(axum::extract::ws::Message::Pong(p))) => Some(Ok(SignalFrame::Pong(p.to_vec()))),
                Some(Ok(axum::extract::ws::Message::Close(_))) => Some(Ok(SignalFrame::Close)),
                Some(Ok(_)) => Some(Ok(SignalFrame::Pong(Vec::new()))), // ignore ping/binary, treat as no-op
                Some(Err(e)) => Some(Err(anyhow!(e))),
            }
        })
    }
}

pub(crate) type OfferFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;
pub(crate) type IceFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

pub struct SignalingHandlers {
    pub on_offer: Arc<dyn Fn(WebRtcSessionRequest) -> OfferFuture + Send + Sync>,
    pub on_ice_candidate: Arc<dyn Fn(String) -> IceFuture + Send + Sync>,
    /// Last measured ping RTT in milliseconds, for `metrics.rs` to read.
    pub ping_rtt_ms: Arc<AtomicU64>,
}

fn sha256_of(raw: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hasher.finalize().into()
}

/// Drives one signaling connection until it closes or a ping times out.
/// Shared by both the LAN `/webrtc/signaling` route and the cloud client.
pub async fn pump(mut socket: impl SignalSocket, handlers: SignalingHandlers) -> Result<()> {
    let mut seen_offers: HashSet<[u8; 32]> = HashSet::new();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_ping_sent: Option<Instant> = None;
    let mut last_pong_at = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_ping_sent.is_some() && last_pong_at.elapsed() > PONG_TIMEOUT {
                    return Err(anyhow!("signaling ping timed out"));
                }
                let now = Instant::now();
                last_ping_sent = Some(now);
                if socket.send_ping(Vec::new()).await.is_err() {
                    return Err(anyhow!("signaling ping send failed"));
                }
            }
            frame = socket.recv_frame() => {
                let Some(frame) = frame else { return Ok(()) };
                match frame? {
                    SignalFrame::Close => return Ok(()),
                    SignalFrame::Pong(_) => {
                        if let Some(sent) = last_ping_sent.take() {
                            handlers.ping_rtt_ms.store(sent.elapsed().as_millis() as u64, Ordering::Relaxed);
                        }
                        last_pong_at = Instant::now();
                    }
                    SignalFrame::Text(text) => {
                        handle_inbound(&mut socket, &handlers, &mut seen_offers, &text).await;
                    }
                }
            }
        }
    }
}

async fn handle_inbound(
    socket: &mut impl SignalSocket,
    handlers: &SignalingHandlers,
    seen_offers: &mut HashSet<[u8; 32]>,
    raw: &str,
) {
    let parsed: InboundSignal = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            let _ = socket.send_text(OutboundSignal::error(format!("invalid signaling message: {e}")).to_text()).await;
            return;
        }
    };

    match parsed {
        InboundSignal::Offer(offer) => {
            let digest = sha256_of(raw);
            if !seen_offers.insert(digest) {
                tracing::debug!("Duplicate offer on this connection, ignoring");
                return;
            }
            match (handlers.on_offer)(offer).await {
                Ok(answer_sdp) => {
                    let _ = socket.send_text(OutboundSignal::answer(answer_sdp).to_text()).await;
                }
                Err(e) => {
                    let _ = socket.send_text(OutboundSignal::error(e.to_string()).to_text()).await;
                }
            }
        }
        InboundSignal::NewIceCandidate(candidate) => {
            if candidate.candidate.is_empty() {
                return;
            }
            if let Err(e) = (handlers.on_ice_candidate)(candidate.candidate).await {
                tracing::warn!(error = %e, "Failed to add ICE candidate");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_answer_serializes_as_type_data() {
        let json = OutboundSignal::answer("v=0...".to_string()).to_text();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "answer");
        assert_eq!(value["data"], "v=0...");
    }

    #[test]
    fn outbound_error_wraps_message() {
        let json = OutboundSignal::error("boom").to_text();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["message"], "boom");
    }

    #[test]
    fn inbound_offer_parses_from_type_data() {
        let raw = r#"{"type":"offer","data":{"sd":"v=0...","ice_servers":[]}}"#;
        match serde_json::from_str::<InboundSignal>(raw).unwrap() {
            InboundSignal::Offer(req) => assert_eq!(req.sdp, "v=0..."),
            other => panic!("expected Offer, got {other:?}"),
        }
    }

    #[test]
    fn inbound_ice_candidate_uses_kebab_case_tag() {
        let raw = r#"{"type":"new-ice-candidate","data":{"candidate":"candidate:1 1 UDP 1 1.2.3.4 9 typ host"}}"#;
        match serde_json::from_str::<InboundSignal>(raw).unwrap() {
            InboundSignal::NewIceCandidate(c) => assert!(c.candidate.starts_with("candidate:")),
            other => panic!("expected NewIceCandidate, got {other:?}"),
        }
    }

    #[test]
    fn sha256_of_is_stable_and_distinguishes_payloads() {
        let a = sha256_of(r#"{"a":1}"#);
        let b = sha256_of(r#"{"a":1}"#);
        let c = sha256_of(r#"{"a":2}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
