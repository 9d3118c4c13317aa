//! Local Auth & HTTP Surface (§4.9): the JSON/WebSocket HTTP API, local
//! password auth with a signed session cookie, cloud device registration,
//! and read-only device/cloud status. Reuses the LAN branch of the C3
//! signaling pump for `/webrtc/signaling` and delegates offer handling to
//! the Session Manager exactly like the cloud path does in `cloud.rs`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use kvmd_protocol::{AuthMode, IceServerInfo, KvmConfig, LoginRequest, WebRtcSessionAnswer, WebRtcSessionRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::auth;
use crate::config::ConfigStore;
use crate::oidc::OidcVerifier;
use crate::peer::IceServerConfig;
use crate::session::SessionManager;
use crate::signaling::{self, IceFuture, OfferFuture, SignalingHandlers};
use crate::virtual_media::VirtualMediaEngine;

const SESSION_COOKIE_NAME: &str = "kvmd_session";
/// Max body size for ordinary JSON endpoints; uploads get their own layer.
const JSON_BODY_LIMIT: usize = 64 * 1024;
const UPLOAD_BODY_LIMIT: usize = 64 * 1024 * 1024;

pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub session_manager: Arc<SessionManager>,
    pub virtual_media: Arc<VirtualMediaEngine>,
    pub oidc: Arc<OidcVerifier>,
    pub http_client: reqwest::Client,
    pub login_limiter: auth::LoginRateLimiter,
    pub started_at: Instant,
    pub device_serial: String,
    /// Last measured LAN signaling ping RTT, read by `metrics`.
    pub lan_ping_rtt_ms: Arc<AtomicU64>,
    pub metrics_logins_attempted: AtomicU64,
    pub metrics_logins_failed: AtomicU64,
    pub metrics_cloud_registrations: AtomicU64,
}

pub(crate) fn ice_servers_from_config(config: &KvmConfig) -> Vec<IceServerConfig> {
    let ice = &config.ice;
    let mut servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        servers.push(IceServerConfig {
            urls: ice.stun_urls.clone(),
            username: None,
            credential: None,
        });
    }
    if !ice.turn_urls.is_empty() {
        servers.push(IceServerConfig {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone(),
            credential: ice.turn_credential.clone(),
        });
    }
    servers
}

fn ice_server_infos(config: &KvmConfig) -> Vec<IceServerInfo> {
    ice_servers_from_config(config)
        .into_iter()
        .map(|s| IceServerInfo { urls: s.urls, username: s.username, credential: s.credential })
        .collect()
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert("strict-transport-security", HeaderValue::from_static("max-age=63072000; includeSubDomains"));
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert("x-xss-protection", HeaderValue::from_static("0"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:; media-src 'self' blob:",
        ),
    );
    headers.insert("permissions-policy", HeaderValue::from_static("camera=(), microphone=(), geolocation=()"));

    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let json_routes = Router::new()
        .route("/webrtc/session", post(webrtc_session))
        .route("/webrtc/signaling", get(webrtc_signaling_ws))
        .route("/cloud/register", post(cloud_register))
        .route("/device/status", get(device_status))
        .route("/device", get(device_info))
        .route("/cloud/state", get(cloud_state))
        .route("/device/ui-config.js", get(ui_config_js))
        .route("/device/setup", post(device_setup))
        .route("/auth/login-local", post(login_local))
        .route("/auth/logout", post(logout))
        .route("/auth/password-local", post(set_password).put(set_password).delete(clear_password))
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .layer(RequestBodyLimitLayer::new(JSON_BODY_LIMIT))
        .with_state(Arc::clone(&state));

    let upload_routes = Router::new()
        .route("/storage/upload", post(storage_upload))
        .layer(RequestBodyLimitLayer::new(UPLOAD_BODY_LIMIT))
        .with_state(Arc::clone(&state));

    let serve_dir = ServeDir::new(&state.config.snapshot().server.web_root);

    json_routes
        .merge(upload_routes)
        .fallback_service(serve_dir)
        .layer(axum::middleware::from_fn(security_headers))
}

fn client_ip(addr: SocketAddr) -> String {
    addr.ip().to_string()
}

fn require_auth(state: &AppState, jar: &CookieJar) -> Result<(), StatusCode> {
    let auth_config = state.config.snapshot().auth;
    if auth_config.mode == AuthMode::NoPassword {
        return Ok(());
    }
    let secret = auth_config.cookie_secret.as_deref().unwrap_or("");
    let cookie = jar.get(SESSION_COOKIE_NAME).ok_or(StatusCode::UNAUTHORIZED)?;
    auth::validate_cookie(cookie.value(), secret).map(|_| ()).map_err(|_| StatusCode::UNAUTHORIZED)
}

fn session_cookie(value: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE_NAME, value))
        .http_only(true)
        .same_site(SameSite::Strict)
        .path("/")
        .build()
}

/// POST /webrtc/session — one-shot LAN SDP exchange (no signaling WS needed).
async fn webrtc_session(State(state): State<Arc<AppState>>, Json(req): Json<WebRtcSessionRequest>) -> impl IntoResponse {
    let ice_servers = ice_servers_from_config(&state.config.snapshot());
    match state.session_manager.exchange_offer(&req.sdp, false, ice_servers).await {
        Ok(sdp) => (StatusCode::OK, Json(WebRtcSessionAnswer { sdp })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "LAN SDP exchange failed");
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// GET /webrtc/signaling — LAN signaling WebSocket, driven by the shared
/// C3 pump. Offers on this path carry no `oidc_google` and aren't dedupe'd
/// against a cloud identity — only the cloud path authenticates the offer.
async fn webrtc_signaling_ws(State(state): State<Arc<AppState>>, ws: axum::extract::ws::WebSocketUpgrade) -> impl IntoResponse {
    let session_manager = Arc::clone(&state.session_manager);
    let ice_servers = ice_servers_from_config(&state.config.snapshot());
    let ping_rtt_ms = Arc::clone(&state.lan_ping_rtt_ms);

    let on_offer: Arc<dyn Fn(WebRtcSessionRequest) -> OfferFuture + Send + Sync> = Arc::new(move |req| {
        let session_manager = Arc::clone(&session_manager);
        let ice_servers = ice_servers.clone();
        Box::pin(async move { session_manager.exchange_offer(&req.sdp, false, ice_servers).await })
    });

    let session_manager_ice = Arc::clone(&state.session_manager);
    let on_ice_candidate: Arc<dyn Fn(String) -> IceFuture + Send + Sync> =
        Arc::new(move |candidate| {
            let session_manager = Arc::clone(&session_manager_ice);
            Box::pin(async move { session_manager.add_ice_candidate(&candidate).await })
        });

    let handlers = SignalingHandlers { on_offer, on_ice_candidate, ping_rtt_ms };

    ws.max_message_size(65_536).on_upgrade(move |socket| async move {
        if let Err(e) = signaling::pump(socket, handlers).await {
            tracing::debug!(error = %e, "LAN signaling connection closed");
        }
    })
}

#[derive(Debug, Deserialize)]
struct CloudRegisterRequest {
    /// Short-lived registration token issued out-of-band.
    token: String,
    /// Google ID token proving device-operator identity.
    id_token: String,
    /// OAuth client id the ID token's `aud` must match.
    client_id: String,
}

#[derive(Debug, Deserialize)]
struct CloudExchangeResponse {
    device_token: String,
}

/// POST /cloud/register — exchange a short-lived token + OIDC identity for
/// a durable cloud device token, bound to `aud:sub` going forward.
async fn cloud_register(State(state): State<Arc<AppState>>, Json(req): Json<CloudRegisterRequest>) -> impl IntoResponse {
    let identity = match state.oidc.verify_for_registration(&req.id_token, &req.client_id).await {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(error = %e, "Cloud registration ID token rejected");
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": e.to_string() }))).into_response();
        }
    };

    let relay_url = state.config.snapshot().cloud.relay_url;
    let register_url = relay_url.replacen("wss://", "https://", 1).replacen("ws://", "http://", 1) + "/register";

    let exchange = state
        .http_client
        .post(&register_url)
        .json(&json!({ "token": req.token, "device_serial": state.device_serial }))
        .send()
        .await
        .and_then(|r| r.error_for_status());

    let durable_token = match exchange {
        Ok(resp) => match resp.json::<CloudExchangeResponse>().await {
            Ok(body) => body.device_token,
            Err(e) => {
                tracing::error!(error = %e, "Cloud registration response was not valid JSON");
                return (StatusCode::BAD_GATEWAY, Json(json!({ "error": "invalid cloud registration response" }))).into_response();
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "Cloud registration token exchange failed");
            return (StatusCode::BAD_GATEWAY, Json(json!({ "error": "cloud registration failed" }))).into_response();
        }
    };

    if let Err(e) = state.config.update(|cfg| {
        cfg.cloud.token = Some(durable_token.clone());
        cfg.cloud.google_identity = Some(identity.clone());
    }) {
        tracing::error!(error = %e, "Failed to persist cloud registration");
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "failed to persist registration" }))).into_response();
    }

    state.metrics_cloud_registrations.fetch_add(1, Ordering::Relaxed);
    tracing::info!(identity = %identity, "Device registered with cloud relay");
    (StatusCode::OK, Json(json!({ "status": "registered" }))).into_response()
}

/// GET /device/status — liveness + session count, no auth required.
async fn device_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_sessions": state.session_manager.active_sessions(),
    }))
}

/// GET /device — static device identity and capability info.
async fn device_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config.snapshot();
    Json(json!({
        "serial": state.device_serial,
        "version": env!("CARGO_PKG_VERSION"),
        "auth_mode": config.auth.mode,
        "setup_complete": config.auth.setup_complete,
        "tls_mode": config.server.tls_mode,
    }))
}

/// GET /cloud/state — whether this device is currently registered.
async fn cloud_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cloud = state.config.snapshot().cloud;
    Json(json!({
        "registered": cloud.token.is_some(),
        "google_identity": cloud.google_identity,
        "relay_url": cloud.relay_url,
    }))
}

/// GET /device/ui-config.js — bootstraps the SPA with public, non-secret
/// config (ICE servers, default viewport) it needs before it can call the
/// JSON API.
async fn ui_config_js(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config.snapshot();
    let payload = json!({
        "ice_servers": ice_server_infos(&config),
        "default_width": config.session.default_width,
        "default_height": config.session.default_height,
        "auth_mode": config.auth.mode,
        "setup_complete": config.auth.setup_complete,
    });
    let body = format!("window.KVMD_CONFIG = {payload};\n");
    ([(axum::http::header::CONTENT_TYPE, "application/javascript; charset=utf-8")], body)
}

#[derive(Debug, Deserialize)]
struct DeviceSetupRequest {
    mode: AuthMode,
    #[serde(default)]
    password: Option<String>,
}

/// POST /device/setup — first-run auth-mode selection. Only reachable while
/// `setup_complete` is still false; repeat calls are rejected so a device
/// can't be silently reconfigured after the fact via this endpoint.
async fn device_setup(State(state): State<Arc<AppState>>, Json(req): Json<DeviceSetupRequest>) -> impl IntoResponse {
    if state.config.snapshot().auth.setup_complete {
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "setup already completed" }))).into_response();
    }

    let password_hash = match (req.mode, &req.password) {
        (AuthMode::Password, Some(password)) if !password.is_empty() => match auth::hash_password(password) {
            Ok(hash) => Some(hash),
            Err(e) => {
                tracing::error!(error = %e, "Failed to hash setup password");
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "failed to hash password" }))).into_response();
            }
        },
        (AuthMode::Password, _) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "password mode requires a password" }))).into_response();
        }
        (AuthMode::NoPassword, _) => None,
    };

    let result = state.config.update(|cfg| {
        cfg.auth.mode = req.mode;
        cfg.auth.password_hash = password_hash;
        if cfg.auth.cookie_secret.is_none() {
            cfg.auth.cookie_secret = Some(auth::generate_secret());
        }
        cfg.auth.setup_complete = true;
    });

    match result {
        Ok(()) => {
            tracing::info!(target: "audit", event = "device_setup_complete", mode = ?req.mode, "First-run setup completed");
            (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to persist setup");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "failed to persist setup" }))).into_response()
        }
    }
}

/// POST /auth/login-local — verify the local password (or pass through
/// unconditionally in `no_password` mode) and issue a signed session cookie.
async fn login_local(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let config = state.config.snapshot();
    state.metrics_logins_attempted.fetch_add(1, Ordering::Relaxed);

    let key = client_ip(addr);
    if !state.login_limiter.check(&key) {
        tracing::warn!(ip = %key, "Login rate limited");
        state.metrics_logins_failed.fetch_add(1, Ordering::Relaxed);
        return (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "error": "too many login attempts" }))).into_response();
    }

    if config.auth.mode == AuthMode::Password {
        let ok = config
            .auth
            .password_hash
            .as_deref()
            .map(|hash| auth::verify_password(&req.password, hash))
            .unwrap_or(false);
        if !ok {
            tracing::info!(target: "audit", event = "login_failure", "Local login failed");
            state.metrics_logins_failed.fetch_add(1, Ordering::Relaxed);
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid credentials" }))).into_response();
        }
    }

    state.login_limiter.clear(&key);
    let secret = config.auth.cookie_secret.clone().unwrap_or_default();
    let token = match auth::sign_cookie("local", &secret) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "Failed to sign session cookie");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response();
        }
    };

    tracing::info!(target: "audit", event = "login_success", "Local login succeeded");
    let jar = jar.add(session_cookie(token));
    (jar, StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

/// POST /auth/logout — clear the session cookie.
async fn logout(jar: CookieJar) -> impl IntoResponse {
    let jar = jar.remove(Cookie::from(SESSION_COOKIE_NAME));
    (jar, StatusCode::OK, Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct PasswordLocalRequest {
    password: String,
}

/// POST/PUT /auth/password-local — set or change the local password.
/// Requires current auth (a no-op check in `no_password` mode).
async fn set_password(State(state): State<Arc<AppState>>, jar: CookieJar, Json(req): Json<PasswordLocalRequest>) -> impl IntoResponse {
    if let Err(status) = require_auth(&state, &jar) {
        return (status, Json(json!({ "error": "unauthorized" }))).into_response();
    }
    if req.password.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "password must not be empty" }))).into_response();
    }
    let hash = match auth::hash_password(&req.password) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "Failed to hash password");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "failed to hash password" }))).into_response();
        }
    };
    let result = state.config.update(|cfg| {
        cfg.auth.mode = AuthMode::Password;
        cfg.auth.password_hash = Some(hash);
        if cfg.auth.cookie_secret.is_none() {
            cfg.auth.cookie_secret = Some(auth::generate_secret());
        }
    });
    match result {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to persist password change");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "failed to persist password" }))).into_response()
        }
    }
}

/// DELETE /auth/password-local — drop back to `no_password` mode.
async fn clear_password(State(state): State<Arc<AppState>>, jar: CookieJar) -> impl IntoResponse {
    if let Err(status) = require_auth(&state, &jar) {
        return (status, Json(json!({ "error": "unauthorized" }))).into_response();
    }
    let result = state.config.update(|cfg| {
        cfg.auth.mode = AuthMode::NoPassword;
        cfg.auth.password_hash = None;
    });
    match result {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to clear password");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "failed to clear password" }))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    #[serde(rename = "uploadId")]
    upload_id: Uuid,
}

/// POST /storage/upload?uploadId=… — HTTP fallback for the `upload_*` data
/// channel protocol; identical resume/throttling semantics (§4.5).
async fn storage_upload(State(state): State<Arc<AppState>>, Query(query): Query<UploadQuery>, body: axum::body::Bytes) -> impl IntoResponse {
    match state.virtual_media.write_upload_chunk(query.upload_id, &body).await {
        Ok(Some(progress)) => (StatusCode::OK, Json(json!(progress))).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::warn!(error = %e, upload_id = %query.upload_id, "Upload chunk rejected");
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// GET /metrics — Prometheus text exposition, gated by `metrics_require_auth`.
async fn metrics(State(state): State<Arc<AppState>>, jar: CookieJar) -> impl IntoResponse {
    let config = state.config.snapshot();
    if config.server.metrics_require_auth {
        if let Err(status) = require_auth(&state, &jar) {
            return (status, "unauthorized").into_response();
        }
    }

    let snapshot = crate::metrics::MetricsSnapshot {
        active_sessions: state.session_manager.active_sessions(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        logins_attempted: state.metrics_logins_attempted.load(Ordering::Relaxed),
        logins_failed: state.metrics_logins_failed.load(Ordering::Relaxed),
        cloud_registrations: state.metrics_cloud_registrations.load(Ordering::Relaxed),
        lan_ping_rtt_ms: state.lan_ping_rtt_ms.load(Ordering::Relaxed),
    };
    let body = crate::metrics::render(&snapshot);

    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body).into_response()
}

/// GET /healthz — liveness probe (ambient addition, not in the distilled
/// spec; grounded on this daemon's own `/device/status` idiom, see DESIGN.md).
async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native_bridge::NativeBridge;
    use crate::session::{SessionHandlers, SessionManager};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn noop_session_handlers() -> SessionHandlers {
        SessionHandlers {
            router_factory: Arc::new(|| crate::rpc::Router::builder().build()),
            on_rpc_open: Arc::new(|_, _, _| {}),
            on_hid_open: Arc::new(|_, _| {}),
            on_disk_open: Arc::new(|_, _| {}),
            on_terminal_open: Arc::new(|_, _| {}),
            on_upload_open: Arc::new(|_, _| {}),
        }
    }

    fn test_state() -> Arc<AppState> {
        let config_path = std::env::temp_dir().join(format!("kvmd-web-test-{}.json", Uuid::new_v4()));
        let config = Arc::new(ConfigStore::new(config_path, KvmConfig::default()));
        let native_bridge = NativeBridge::spawn(PathBuf::from("/bin/true"), CancellationToken::new());
        let session_manager = SessionManager::new(native_bridge, noop_session_handlers());
        let images_dir = std::env::temp_dir().join(format!("kvmd-web-test-images-{}", Uuid::new_v4()));
        let virtual_media = VirtualMediaEngine::new(images_dir, reqwest::Client::new());

        Arc::new(AppState {
            config,
            session_manager,
            virtual_media,
            oidc: Arc::new(OidcVerifier::new(reqwest::Client::new())),
            http_client: reqwest::Client::new(),
            login_limiter: auth::LoginRateLimiter::new(5, 60),
            started_at: Instant::now(),
            device_serial: "test-serial".to_string(),
            lan_ping_rtt_ms: Arc::new(AtomicU64::new(0)),
            metrics_logins_attempted: AtomicU64::new(0),
            metrics_logins_failed: AtomicU64::new(0),
            metrics_cloud_registrations: AtomicU64::new(0),
        })
    }

    async fn body_json(response: axum::response::Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let state = test_state();
        let app = build_router(state);
        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn device_status_reports_zero_sessions_initially() {
        let state = test_state();
        let app = build_router(state);
        let request = Request::builder().uri("/device/status").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["active_sessions"], 0);
    }

    #[tokio::test]
    async fn setup_rejected_after_completion() {
        let state = test_state();
        state.config.update(|cfg| cfg.auth.setup_complete = true).unwrap();
        let app = build_router(state);

        let body = json!({ "mode": "no_password" });
        let request = Request::builder()
            .method("POST")
            .uri("/device/setup")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn setup_password_mode_requires_password() {
        let state = test_state();
        let app = build_router(state);

        let body = json!({ "mode": "password" });
        let request = Request::builder()
            .method("POST")
            .uri("/device/setup")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn setup_no_password_mode_completes() {
        let state = test_state();
        let app = build_router(Arc::clone(&state));

        let body = json!({ "mode": "no_password" });
        let request = Request::builder()
            .method("POST")
            .uri("/device/setup")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.config.snapshot().auth.setup_complete);
    }

    #[tokio::test]
    async fn login_succeeds_unconditionally_in_no_password_mode() {
        let state = test_state();
        let app = build_router(state);

        let body = json!({ "password": "anything" });
        let request = Request::builder()
            .method("POST")
            .uri("/auth/login-local")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_rejects_wrong_password_in_password_mode() {
        let state = test_state();
        let hash = auth::hash_password("correct-horse").unwrap();
        state
            .config
            .update(|cfg| {
                cfg.auth.mode = AuthMode::Password;
                cfg.auth.password_hash = Some(hash);
                cfg.auth.cookie_secret = Some("secret".to_string());
            })
            .unwrap();
        let app = build_router(state);

        let body = json!({ "password": "wrong" });
        let request = Request::builder()
            .method("POST")
            .uri("/auth/login-local")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn metrics_accessible_without_auth_by_default() {
        let state = test_state();
        let app = build_router(state);
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_requires_auth_when_configured() {
        let state = test_state();
        state
            .config
            .update(|cfg| {
                cfg.server.metrics_require_auth = true;
                cfg.auth.mode = AuthMode::Password;
                cfg.auth.cookie_secret = Some("secret".to_string());
            })
            .unwrap();
        let app = build_router(state);
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let state = test_state();
        let app = build_router(state);
        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get("x-frame-options").map(|v| v.as_bytes()),
            Some(b"DENY".as_slice())
        );
    }

    #[tokio::test]
    async fn cloud_state_reports_unregistered_by_default() {
        let state = test_state();
        let app = build_router(state);
        let request = Request::builder().uri("/cloud/state").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["registered"], false);
    }

    #[tokio::test]
    async fn ui_config_js_is_served_as_javascript() {
        let state = test_state();
        let app = build_router(state);
        let request = Request::builder().uri("/device/ui-config.js").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap().to_str().unwrap().to_string();
        assert!(content_type.contains("javascript"));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = std::str::from_utf8(&bytes).unwrap();
        assert!(body.starts_with("window.KVMD_CONFIG ="));
    }
}
