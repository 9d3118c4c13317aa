//! Cloud Client (C7): a supervisor loop dialing out to a cloud relay over
//! WebSocket, reusing the C3 signaling pump once connected. Offers arriving
//! over this path additionally go through OIDC verification before being
//! handed to the Session Manager.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use kvmd_protocol::WebRtcSessionRequest;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use crate::oidc::OidcVerifier;
use crate::peer::IceServerConfig;
use crate::session::SessionManager;
use crate::signaling::{self, IceFuture, OfferFuture, RecvFuture, SendFuture, SignalFrame, SignalSocket, SignalingHandlers};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct CloudClientConfig {
    pub cloud_url: String,
    pub cloud_token: String,
    pub device_serial: String,
    pub google_identity: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub build_timestamp_secs: u64,
}

/// Shared, mutable state the rest of the daemon updates so the cloud client
/// can evaluate its dial preconditions without owning those subsystems.
pub struct CloudPreconditions {
    pub nic_has_ip: Arc<dyn Fn() -> bool + Send + Sync>,
    pub time_synced_once: Arc<AtomicBool>,
}

fn preconditions_met(cfg: &CloudClientConfig, preconditions: &CloudPreconditions) -> bool {
    if cfg.cloud_token.is_empty() {
        return false;
    }
    if !(preconditions.nic_has_ip)() {
        return false;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if now < cfg.build_timestamp_secs && !preconditions.time_synced_once.load(Ordering::Relaxed) {
        return false;
    }
    true
}

/// Runs forever, reconnecting on a flat 5-second delay whenever the
/// connection drops or preconditions aren't currently met.
pub async fn run(
    cfg: CloudClientConfig,
    preconditions: CloudPreconditions,
    session_manager: Arc<SessionManager>,
    oidc: Arc<OidcVerifier>,
) {
    loop {
        if !preconditions_met(&cfg, &preconditions) {
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }

        match connect_and_pump(&cfg, Arc::clone(&session_manager), Arc::clone(&oidc)).await {
            Ok(()) => tracing::info!("Cloud connection closed cleanly"),
            Err(e) => tracing::warn!(error = %e, "Cloud connection failed"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

fn build_tls_connector() -> Connector {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().expect("could not load platform certs") {
        let _ = root_store.add(cert);
    }
    let tls_config = rustls::ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth();
    Connector::Rustls(Arc::new(tls_config))
}

async fn connect_and_pump(cfg: &CloudClientConfig, session_manager: Arc<SessionManager>, oidc: Arc<OidcVerifier>) -> Result<()> {
    let uri: tokio_tungstenite::tungstenite::http::Uri = cfg.cloud_url.parse().context("invalid cloud URL")?;
    let host = uri.host().ok_or_else(|| anyhow!("cloud URL has no host"))?.to_string();

    let request = Request::builder()
        .method("GET")
        .uri(cfg.cloud_url.clone())
        .header("Host", host)
        .header("Authorization", format!("Bearer {}", cfg.cloud_token))
        .header("X-Device-ID", cfg.device_serial.clone())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .body(())
        .context("failed to build cloud handshake request")?;

    let connector = build_tls_connector();
    let (stream, _response) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector)),
    )
    .await
    .context("cloud handshake timed out")?
    .context("cloud WebSocket handshake failed")?;

    tracing::info!(url = %cfg.cloud_url, "Connected to cloud relay");

    let ping_rtt_ms = Arc::new(AtomicU64::new(0));
    let handlers = build_handlers(cfg, session_manager, oidc, Arc::clone(&ping_rtt_ms));
    signaling::pump(CloudSocket(stream), handlers).await
}

fn build_handlers(
    cfg: &CloudClientConfig,
    session_manager: Arc<SessionManager>,
    oidc: Arc<OidcVerifier>,
    ping_rtt_ms: Arc<AtomicU64>,
) -> SignalingHandlers {
    let google_identity = cfg.google_identity.clone();
    let ice_servers = cfg.ice_servers.clone();

    let on_offer: Arc<dyn Fn(WebRtcSessionRequest) -> OfferFuture + Send + Sync> = Arc::new(move |req| {
        let session_manager = Arc::clone(&session_manager);
        let oidc = Arc::clone(&oidc);
        let google_identity = google_identity.clone();
        let ice_servers = ice_servers.clone();
        Box::pin(async move {
            let token = req.oidc_google.as_deref().ok_or_else(|| anyhow!("cloud offer missing oidc_google token"))?;
            oidc.verify(token, &google_identity).await.context("cloud offer failed OIDC verification")?;
            session_manager.exchange_offer(&req.sdp, true, ice_servers).await
        })
    });

    let on_ice_candidate: Arc<dyn Fn(String) -> IceFuture + Send + Sync> = {
        Arc::new(move |_candidate| Box::pin(async move { bail!("cloud path does not carry trickled ICE candidates") }))
    };

    SignalingHandlers { on_offer, on_ice_candidate, ping_rtt_ms }
}

/// Adapts a `tokio-tungstenite` client stream to the shared signaling
/// framing so `signaling::pump` can drive either transport identically.
struct CloudSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl SignalSocket for CloudSocket {
    fn send_text(&mut self, text: String) -> SendFuture<'_> {
        Box::pin(async move { self.0.send(Message::Text(text.into())).await.map_err(|e| anyhow!(e)) })
    }

    fn send_ping(&mut self, payload: Vec<u8>) -> SendFuture<'_> {
        Box::pin(async move { self.0.send(Message::Ping(payload.into())).await.map_err(|e| anyhow!(e)) })
    }

    fn recv_frame(&mut self) -> RecvFuture<'_> {
        Box::pin(async move {
            match StreamExt::next(&mut self.0).await {
                None => None,
                Some(Ok(Message::Text(t))) => Some(Ok(SignalFrame::Text(t.to_string()))),
                Some(Ok(Message::Pong(p))) => Some(Ok(SignalFrame::Pong(p.to_vec()))),
                Some(Ok(Message::Close(_))) => Some(Ok(SignalFrame::Close)),
                Some(Ok(_)) => Some(Ok(SignalFrame::Pong(Vec::new()))),
                Some(Err(e)) => Some(Err(anyhow!(e))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> CloudClientConfig {
        CloudClientConfig {
            cloud_url: "wss://cloud.example.com/connect".to_string(),
            cloud_token: "token".to_string(),
            device_serial: "serial-1".to_string(),
            google_identity: "client-id:subject".to_string(),
            ice_servers: vec![],
            build_timestamp_secs: 0,
        }
    }

    fn preconditions(has_ip: bool, synced: bool) -> CloudPreconditions {
        CloudPreconditions { nic_has_ip: Arc::new(move || has_ip), time_synced_once: Arc::new(AtomicBool::new(synced)) }
    }

    #[test]
    fn refuses_to_dial_without_token() {
        let mut cfg = base_config();
        cfg.cloud_token.clear();
        assert!(!preconditions_met(&cfg, &preconditions(true, true)));
    }

    #[test]
    fn refuses_to_dial_without_nic_ip() {
        let cfg = base_config();
        assert!(!preconditions_met(&cfg, &preconditions(false, true)));
    }

    #[test]
    fn allows_dial_when_build_timestamp_is_in_the_past() {
        let cfg = base_config();
        assert!(preconditions_met(&cfg, &preconditions(true, false)));
    }

    #[test]
    fn requires_time_sync_when_clock_precedes_build_timestamp() {
        let mut cfg = base_config();
        cfg.build_timestamp_secs = u64::MAX / 2;
        assert!(!preconditions_met(&cfg, &preconditions(true, false)));
        assert!(preconditions_met(&cfg, &preconditions(true, true)));
    }
}
