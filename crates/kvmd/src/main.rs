//! Daemon entry point: wires the seven components together and drives
//! startup/shutdown. Owns nothing itself beyond the `tokio::main` task —
//! every long-lived piece of state lives in the module that defines it.

mod auth;
mod cloud;
mod config;
mod disk_backend;
mod hid;
mod jiggler;
mod metrics;
mod native_bridge;
mod nbd;
mod oidc;
mod peer;
mod rpc;
mod session;
mod signaling;
mod terminal;
mod tls;
mod virtual_media;
mod watchdog;
mod web;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kvmd_protocol::{JsonRpcError, KvmConfig, TlsMode};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::config::ConfigStore;
use crate::hid::HidFanOut;
use crate::jiggler::ActivityTracker;
use crate::native_bridge::NativeBridge;
use crate::session::{SessionHandlers, SessionManager};
use crate::virtual_media::{MediaMode, VirtualMediaEngine};
use crate::web::AppState;

const COOKIE_SECRET_PATH: &str = "/userdata/kvm/auth/cookie_secret";
const NATIVE_BRIDGE_BINARY_PATH: &str = "/usr/bin/kvmd-native";
const IMAGES_DIR: &str = "/userdata/kvm/images";
const STALE_SESSION_SWEEP: Duration = Duration::from_secs(60);
/// Baked in at release time in the original appliance image; used to gate
/// cloud dialing until the clock has synced past it on devices that boot
/// with no RTC battery. There's no real release pipeline here, so this is a
/// fixed placeholder rather than a build-script-stamped value.
const BUILD_TIMESTAMP_SECS: u64 = 1_700_000_000;

fn parse_args() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from(config::DEFAULT_CONFIG_PATH);
    let mut i = 1;
    while i < args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            config_path = PathBuf::from(&args[i + 1]);
            i += 1;
        }
        i += 1;
    }
    config_path
}

/// Reads the SoC serial out of `/proc/cpuinfo`'s `Serial : <value>` line,
/// matching the device identity used for cloud registration. Falls back to
/// a fixed placeholder on hosts without that line (dev boxes, CI).
fn device_serial() -> String {
    let Ok(contents) = std::fs::read_to_string("/proc/cpuinfo") else {
        return "unknown_device_id".to_string();
    };
    contents
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "Serial").then(|| value.trim().to_string())
        })
        .unwrap_or_else(|| "unknown_device_id".to_string())
}

/// Loads the cookie-signing secret from `COOKIE_SECRET_PATH` if present,
/// otherwise generates one and persists it with `0600` permissions so
/// existing local-auth sessions survive a restart.
fn load_or_generate_cookie_secret() -> String {
    if let Ok(existing) = std::fs::read_to_string(COOKIE_SECRET_PATH) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let secret = auth::generate_secret();
    if let Some(dir) = Path::new(COOKIE_SECRET_PATH).parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(error = %e, "Failed to create cookie secret directory");
        }
    }
    use std::os::unix::fs::OpenOptionsExt;
    match std::fs::OpenOptions::new().write(true).create(true).truncate(true).mode(0o600).open(COOKIE_SECRET_PATH) {
        Ok(mut f) => {
            use std::io::Write;
            if let Err(e) = f.write_all(secret.as_bytes()) {
                tracing::warn!(error = %e, "Failed to persist cookie secret");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to open cookie secret file for writing"),
    }
    secret
}

fn build_tls_server_config(config: &KvmConfig) -> Result<Option<rustls::ServerConfig>> {
    match config.server.tls_mode {
        TlsMode::Disabled => Ok(None),
        TlsMode::Custom => {
            let cert = config.server.tls_cert.as_deref().context("tls_mode=custom but tls_cert unset")?;
            let key = config.server.tls_key.as_deref().context("tls_mode=custom but tls_key unset")?;
            Ok(Some(tls::custom_tls_config(cert, key)?))
        }
        TlsMode::SelfSigned => Ok(Some(tls::self_signed_tls_config()?)),
    }
}

fn internal_err(e: anyhow::Error) -> JsonRpcError {
    JsonRpcError::internal_error(e.to_string())
}

fn require_u16_field(params: &Value, field: &str) -> Result<u16, JsonRpcError> {
    params
        .get(field)
        .and_then(Value::as_u64)
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| JsonRpcError::invalid_params(format!("field {field} must be a u16")))
}

fn require_i8_field(params: &Value, field: &str) -> Result<i8, JsonRpcError> {
    params
        .get(field)
        .and_then(Value::as_i64)
        .and_then(|n| i8::try_from(n).ok())
        .ok_or_else(|| JsonRpcError::invalid_params(format!("field {field} must be an i8")))
}

fn require_u64_field(params: &Value, field: &str) -> Result<u64, JsonRpcError> {
    params
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| JsonRpcError::invalid_params(format!("field {field} must be a u64")))
}

fn require_str_field<'a>(params: &'a Value, field: &str) -> Result<&'a str, JsonRpcError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::invalid_params(format!("field {field} must be a string")))
}

fn require_bytes_field(params: &Value, field: &str) -> Result<Vec<u8>, JsonRpcError> {
    let raw = params
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| JsonRpcError::invalid_params(format!("field {field} must be an array")))?;
    raw.iter()
        .map(|v| {
            v.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| JsonRpcError::invalid_params(format!("field {field} entries must be bytes")))
        })
        .collect()
}

fn require_media_mode(params: &Value) -> Result<MediaMode, JsonRpcError> {
    let raw = require_str_field(params, "mode")?;
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| JsonRpcError::invalid_params(format!("mode must be 'cdrom' or 'disk', got '{raw}'")))
}

/// Builds the JSON-RPC method table every session's `rpc` data channel gets,
/// per §4.4's requirement that the dispatch routes opened channels rather
/// than a single input sink. Matches the same `HidFanOut`/`VirtualMediaEngine`
/// methods the "hid"/"disk" binary channel protocols call.
fn build_router_factory(
    hid: Arc<HidFanOut>,
    activity: ActivityTracker,
    virtual_media: Arc<VirtualMediaEngine>,
) -> Arc<dyn Fn() -> rpc::Router + Send + Sync> {
    Arc::new(move || {
        let hid = Arc::clone(&hid);
        let activity = activity.clone();
        let vm = Arc::clone(&virtual_media);

        let hid_kb = Arc::clone(&hid);
        let activity_kb = activity.clone();
        let hid_mouse = Arc::clone(&hid);
        let activity_mouse = activity.clone();
        let hid_wheel = Arc::clone(&hid);
        let activity_wheel = activity.clone();
        let vm_storage = Arc::clone(&vm);
        let vm_http = Arc::clone(&vm);
        let vm_webrtc = Arc::clone(&vm);
        let vm_unmount = Arc::clone(&vm);
        let vm_upload = Arc::clone(&vm);

        rpc::Router::builder()
            .method("keyboardReport", move |params| {
                let hid = Arc::clone(&hid_kb);
                let activity = activity_kb.clone();
                async move {
                    let modifier = rpc::require_byte_field(&params, "modifier")?;
                    let keys = require_bytes_field(&params, "keys")?;
                    activity.touch();
                    hid.keyboard_report(modifier, &keys).await.map_err(internal_err)?;
                    Ok(Value::Null)
                }
            })
            .method("absMouseReport", move |params| {
                let hid = Arc::clone(&hid_mouse);
                let activity = activity_mouse.clone();
                async move {
                    let x = require_u16_field(&params, "x")?;
                    let y = require_u16_field(&params, "y")?;
                    let buttons = rpc::require_byte_field(&params, "buttons")?;
                    activity.touch();
                    hid.abs_mouse_report(x, y, buttons).await.map_err(internal_err)?;
                    Ok(Value::Null)
                }
            })
            .method("wheelReport", move |params| {
                let hid = Arc::clone(&hid_wheel);
                let activity = activity_wheel.clone();
                async move {
                    let wheel_y = require_i8_field(&params, "wheel_y")?;
                    activity.touch();
                    hid.wheel_report(wheel_y).await.map_err(internal_err)?;
                    Ok(Value::Null)
                }
            })
            .method("mountWithStorage", move |params| {
                let vm = Arc::clone(&vm_storage);
                async move {
                    let filename = require_str_field(&params, "filename")?.to_string();
                    let mode = require_media_mode(&params)?;
                    vm.mount_storage(&filename, mode).await.map_err(internal_err)?;
                    Ok(Value::Null)
                }
            })
            .method("mountWithHTTP", move |params| {
                let vm = Arc::clone(&vm_http);
                async move {
                    let url = require_str_field(&params, "url")?.to_string();
                    let mode = require_media_mode(&params)?;
                    vm.mount_http(&url, mode).await.map_err(internal_err)?;
                    Ok(Value::Null)
                }
            })
            .method("mountWithWebRTC", move |params| {
                let vm = Arc::clone(&vm_webrtc);
                async move {
                    let size_bytes = require_u64_field(&params, "size_bytes")?;
                    let mode = require_media_mode(&params)?;
                    vm.mount_webrtc_on_bound_channel(size_bytes, mode).await.map_err(internal_err)?;
                    Ok(Value::Null)
                }
            })
            .method("unmountImage", move |_params| {
                let vm = Arc::clone(&vm_unmount);
                async move {
                    vm.unmount().await.map_err(internal_err)?;
                    Ok(Value::Null)
                }
            })
            .method("startStorageFileUpload", move |params| {
                let vm = Arc::clone(&vm_upload);
                async move {
                    let filename = require_str_field(&params, "filename")?.to_string();
                    let size = require_u64_field(&params, "size")?;
                    let result = vm.start_upload(&filename, size).await.map_err(internal_err)?;
                    Ok(serde_json::json!({
                        "already_uploaded_bytes": result.already_uploaded_bytes,
                        "data_channel": result.data_channel,
                    }))
                }
            })
            .build()
    })
}

/// Binds an `upload_<uuid>` data channel to its `PendingUpload`: writes every
/// binary frame it carries and emits progress events until the upload
/// finishes or the channel closes early.
fn bind_upload_channel(virtual_media: Arc<VirtualMediaEngine>, dc: Arc<RTCDataChannel>) {
    let label = dc.label().to_string();
    let Some(id_str) = label.strip_prefix("upload_") else {
        tracing::warn!(%label, "Upload channel opened with unexpected label");
        return;
    };
    let Ok(upload_id) = Uuid::parse_str(id_str) else {
        tracing::warn!(%label, "Upload channel label is not a valid uuid");
        return;
    };

    let dc_for_message = Arc::clone(&dc);
    tokio::spawn(async move {
        dc_for_message
            .on_message(Box::new(move |msg: DataChannelMessage| {
                let virtual_media = Arc::clone(&virtual_media);
                let dc = Arc::clone(&dc_for_message);
                Box::pin(async move {
                    if msg.is_string {
                        return;
                    }
                    match virtual_media.write_upload_chunk(upload_id, &msg.data).await {
                        Ok(Some(progress)) => {
                            let event = serde_json::to_string(&progress).unwrap_or_default();
                            let _ = dc.send_text(event).await;
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(error = %e, %upload_id, "Upload chunk write failed"),
                    }
                })
            }))
            .await;
    });
}

/// Serves one accepted plain-HTTP connection.
async fn serve_plain(stream: tokio::net::TcpStream, peer_addr: SocketAddr, app: axum::Router) {
    let io = hyper_util::rt::TokioIo::new(stream);
    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
    let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
        tracing::debug!(%peer_addr, error = %e, "Connection error");
    }
}

/// Accept loop for the HTTPS listener: each connection gets its own TLS
/// handshake with a 10-second timeout, same as the plain-HTTP path but with
/// the rustls layer spliced in before handing off to hyper.
async fn serve_tls(listener: TcpListener, acceptor: tokio_rustls::TlsAcceptor, app: axum::Router, token: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept TLS TCP connection");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(Duration::from_secs(10), acceptor.accept(stream)).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "TLS handshake timed out");
                            return;
                        }
                    };
                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, error = %e, "Connection error");
                    }
                });
            }
            _ = token.cancelled() => return,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = parse_args();
    let initial_config = config::load_config(&config_path)?;
    if let Err(issues) = initial_config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!("Configuration has {} issue(s); fix the ERROR(s) above and restart.", issues.len());
            std::process::exit(1);
        }
    }

    if !Path::new(&initial_config.server.web_root).is_dir() {
        tracing::warn!(
            web_root = %initial_config.server.web_root,
            "Web root does not exist — the UI will not load"
        );
    }

    let device_serial = device_serial();
    let cookie_secret = initial_config.auth.cookie_secret.clone().unwrap_or_else(load_or_generate_cookie_secret);

    let config_store = {
        let mut config = initial_config.clone();
        config.auth.cookie_secret = Some(cookie_secret.clone());
        Arc::new(ConfigStore::new(config_path, config))
    };

    let root_token = CancellationToken::new();

    let native_bridge = NativeBridge::spawn(PathBuf::from(NATIVE_BRIDGE_BINARY_PATH), root_token.child_token());
    tokio::spawn(watchdog::run(root_token.child_token()));

    std::fs::create_dir_all(IMAGES_DIR).context("failed to create images directory")?;
    let http_client = reqwest::Client::new();
    let virtual_media = VirtualMediaEngine::new(PathBuf::from(IMAGES_DIR), http_client.clone());
    let hid_fanout = Arc::new(HidFanOut::new());
    let activity_tracker = ActivityTracker::new();

    {
        let config = config_store.snapshot();
        if config.jiggler.enabled {
            let jiggler_config = jiggler::JigglerConfig {
                interval: Duration::from_secs(config.jiggler.schedule_seconds as u64),
                inactivity_limit: Duration::from_secs(config.jiggler.inactivity_limit_seconds as u64),
                jitter_percentage: config.jiggler.jitter_percentage as f64 / 100.0,
            };
            tokio::spawn(jiggler::run(jiggler_config, activity_tracker.clone(), Arc::clone(&hid_fanout)));
        }
    }

    let router_factory = build_router_factory(Arc::clone(&hid_fanout), activity_tracker.clone(), Arc::clone(&virtual_media));

    let session_handlers = {
        let hid_fanout = Arc::clone(&hid_fanout);
        let activity_tracker = activity_tracker.clone();
        let virtual_media = Arc::clone(&virtual_media);

        SessionHandlers {
            router_factory,
            on_rpc_open: Arc::new(move |session_id, dc, router| {
                tracing::info!(%session_id, "rpc channel opened");
                let dc_for_loop = Arc::clone(&dc);
                let router_for_loop = Arc::clone(&router);
                tokio::spawn(async move {
                    dc_for_loop
                        .on_message(Box::new(move |msg: DataChannelMessage| {
                            let router = Arc::clone(&router_for_loop);
                            let dc = Arc::clone(&dc_for_loop);
                            Box::pin(async move {
                                if msg.is_string {
                                    if let Ok(text) = String::from_utf8(msg.data.to_vec()) {
                                        match router.dispatch(&text).await {
                                            rpc::Dispatched::Reply(reply) => {
                                                let _ = dc.send_text(reply).await;
                                            }
                                            rpc::Dispatched::EventHandled | rpc::Dispatched::ResponseDelivered => {}
                                        }
                                    }
                                }
                            })
                        }))
                        .await;
                });

                let hydrate_dc = Arc::clone(&dc);
                tokio::spawn(async move {
                    let video = rpc::Router::encode_event("videoInputState", serde_json::json!({"ready": true}));
                    let _ = hydrate_dc.send_text(video).await;
                    let usb = rpc::Router::encode_event("usbState", serde_json::json!({"keyboard": true, "mouse": true}));
                    let _ = hydrate_dc.send_text(usb).await;
                });
            }),
            on_hid_open: Arc::new(move |session_id, dc| {
                tracing::info!(%session_id, "hid channel opened");
                let hid_fanout = Arc::clone(&hid_fanout);
                let activity = activity_tracker.clone();
                tokio::spawn(async move {
                    hid_fanout.bind_data_channel(activity, dc).await;
                });
            }),
            on_disk_open: Arc::new(move |session_id, dc| {
                tracing::info!(%session_id, "disk channel opened");
                let virtual_media = Arc::clone(&virtual_media);
                tokio::spawn(async move {
                    virtual_media.bind_disk_channel(dc).await;
                });
            }),
            on_terminal_open: Arc::new(move |session_id, dc| {
                tracing::info!(%session_id, "terminal channel opened");
                tokio::spawn(async move {
                    if let Err(e) = terminal::TerminalSession::spawn(dc).await {
                        tracing::warn!(error = %e, "Failed to spawn terminal session");
                    }
                });
            }),
            on_upload_open: Arc::new(move |session_id, dc| {
                tracing::info!(%session_id, "upload channel opened");
                bind_upload_channel(Arc::clone(&virtual_media), dc);
            }),
        }
    };

    let session_manager = SessionManager::new(Arc::clone(&native_bridge), session_handlers);

    let oidc = Arc::new(oidc::OidcVerifier::new(http_client.clone()));

    let nic_has_ip: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(|| {
        std::fs::read_to_string("/proc/net/route").map(|s| s.lines().count() > 1).unwrap_or(false)
    });
    let time_synced_once = Arc::new(AtomicBool::new(false));
    {
        let time_synced_once = Arc::clone(&time_synced_once);
        tokio::spawn(async move {
            loop {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                if now >= BUILD_TIMESTAMP_SECS {
                    time_synced_once.store(true, std::sync::atomic::Ordering::Relaxed);
                    return;
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
    }

    {
        let config = config_store.snapshot();
        let cloud_cfg = cloud::CloudClientConfig {
            cloud_url: config.cloud.relay_url.clone(),
            cloud_token: config.cloud.token.clone().unwrap_or_default(),
            device_serial: device_serial.clone(),
            google_identity: config.cloud.google_identity.clone().unwrap_or_default(),
            ice_servers: web::ice_servers_from_config(&config),
            build_timestamp_secs: BUILD_TIMESTAMP_SECS,
        };
        let preconditions = cloud::CloudPreconditions { nic_has_ip, time_synced_once };
        let session_manager = Arc::clone(&session_manager);
        let oidc = Arc::clone(&oidc);
        tokio::spawn(cloud::run(cloud_cfg, preconditions, session_manager, oidc));
    }

    let state = Arc::new(AppState {
        config: Arc::clone(&config_store),
        session_manager: Arc::clone(&session_manager),
        virtual_media,
        oidc,
        http_client,
        login_limiter: auth::LoginRateLimiter::new(5, 60),
        started_at: std::time::Instant::now(),
        device_serial,
        lan_ping_rtt_ms: Arc::new(AtomicU64::new(0)),
        metrics_logins_attempted: AtomicU64::new(0),
        metrics_logins_failed: AtomicU64::new(0),
        metrics_cloud_registrations: AtomicU64::new(0),
    });

    {
        let reaper_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(STALE_SESSION_SWEEP).await;
                let idle_timeout = reaper_state.config.snapshot().session.idle_timeout_seconds;
                if idle_timeout == 0 {
                    continue;
                }
                if let Some(session) = reaper_state.session_manager.current().await {
                    let idle_secs = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0)
                        .saturating_sub(session.last_activity.load(std::sync::atomic::Ordering::Relaxed));
                    if idle_secs > idle_timeout as u64 {
                        tracing::info!(session_id = %session.id, idle_secs, "Reaping stale session");
                        reaper_state.session_manager.close_current().await;
                    }
                }
            }
        });
    }

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(|response: &axum::http::Response<_>, latency: Duration, _span: &tracing::Span| {
                    tracing::event!(
                        Level::INFO,
                        status = %response.status().as_u16(),
                        duration_ms = %latency.as_millis(),
                        "completed"
                    );
                }),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let server_config = config_store.snapshot().server;
    let http_addr: SocketAddr = format!("{}:{}", server_config.bind, server_config.http_port)
        .parse()
        .context("invalid bind address")?;
    let http_listener = TcpListener::bind(http_addr).await.with_context(|| format!("failed to bind to {http_addr}"))?;

    tracing::info!("===========================================");
    tracing::info!("  kvmd session-plane daemon");
    tracing::info!("  Listening on http://{http_addr}");

    let https_listen_token = root_token.child_token();
    if server_config.https_port != 0 {
        if let Some(tls_config) = build_tls_server_config(&config_store.snapshot())? {
            let https_addr: SocketAddr = format!("{}:{}", server_config.bind, server_config.https_port)
                .parse()
                .context("invalid TLS bind address")?;
            let https_listener = TcpListener::bind(https_addr).await.with_context(|| format!("failed to bind to {https_addr}"))?;
            let acceptor = tls::make_acceptor(tls_config);
            tracing::info!("  Listening on https://{https_addr}");
            tokio::spawn(serve_tls(https_listener, acceptor, app.clone(), https_listen_token));
        }
    }
    tracing::info!("===========================================");
    tracing::info!("Daemon ready, accepting connections");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = http_listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept TCP connection");
                        continue;
                    }
                };
                tokio::spawn(serve_plain(stream, peer_addr, app.clone()));
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    // Shutdown order per the session-plane teardown invariant: stop
    // accepting new work, cancel the native bridge subprocess and watchdog
    // heartbeat, then close out the current session so in-flight RPCs fail
    // fast rather than hang until the socket times out.
    root_token.cancel();
    state.session_manager.close_current().await;
    tracing::info!("kvmd shut down cleanly");

    Ok(())
}
