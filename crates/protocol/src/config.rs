use serde::{Deserialize, Serialize};

/// TLS provisioning mode for the HTTPS listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    Disabled,
    SelfSigned,
    Custom,
}

impl Default for TlsMode {
    fn default() -> Self {
        TlsMode::SelfSigned
    }
}

/// Local authentication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Password,
    NoPassword,
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::NoPassword
    }
}

/// Top-level configuration, persisted as `/userdata/kvm_config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvmConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub usb: UsbConfig,
    #[serde(default)]
    pub jiggler: JigglerConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub wol_devices: Vec<WolDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Plain HTTP port (also serves the WebSocket upgrade)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// HTTPS port. 0 disables the TLS listener entirely.
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default)]
    pub tls_mode: TlsMode,
    /// Path to TLS certificate, used only when tls_mode = custom
    pub tls_cert: Option<String>,
    /// Path to TLS key, used only when tls_mode = custom
    pub tls_key: Option<String>,
    /// Path to web client static files
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// Require an authenticated session for /metrics (default: false)
    #[serde(default)]
    pub metrics_require_auth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Requested bitrate in kbps, forwarded to the native bridge as a quality factor
    #[serde(default = "default_bitrate")]
    pub bitrate_kbps: u32,
    #[serde(default = "default_min_bitrate")]
    pub min_bitrate_kbps: u32,
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate_kbps: u32,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Maximum width (0 = unlimited, default: 1920)
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    /// Maximum height (0 = unlimited, default: 1080)
    #[serde(default = "default_max_height")]
    pub max_height: u32,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Default viewport width reported to a fresh session
    #[serde(default = "default_width")]
    pub default_width: u32,
    #[serde(default = "default_height")]
    pub default_height: u32,
    /// Idle timeout in seconds (0 = disabled)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
}

/// Cloud relay binding: durable token plus the OIDC identity it was bound
/// to at registration time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub token: Option<String>,
    /// `"{aud}:{sub}"` of the Google identity this device is bound to
    #[serde(default)]
    pub google_identity: Option<String>,
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
}

#[derive(Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Argon2id PHC string; `None` until a password is set
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Secret used to sign the local-auth session cookie
    #[serde(default)]
    pub cookie_secret: Option<String>,
    /// Set by `POST /device/setup`. Until then, that endpoint stays
    /// reachable and the rest of the local-auth surface should treat the
    /// device as still in first-run state.
    #[serde(default)]
    pub setup_complete: bool,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("mode", &self.mode)
            .field("password_hash", &self.password_hash.as_ref().map(|_| "[SET]"))
            .field("cookie_secret", &self.cookie_secret.as_ref().map(|_| "[SET]"))
            .field("setup_complete", &self.setup_complete)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbConfig {
    #[serde(default = "default_true")]
    pub keyboard_enabled: bool,
    #[serde(default = "default_true")]
    pub mouse_enabled: bool,
    #[serde(default = "default_true")]
    pub mass_storage_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JigglerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_jiggler_schedule_seconds")]
    pub schedule_seconds: u32,
    #[serde(default = "default_inactivity_limit_seconds")]
    pub inactivity_limit_seconds: u32,
    /// Uniform random jitter, as a percentage of schedule_seconds, applied
    /// before each wiggle so it isn't perfectly periodic
    #[serde(default)]
    pub jitter_percentage: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub dim_after_seconds: u32,
    #[serde(default)]
    pub off_after_seconds: u32,
    #[serde(default)]
    pub edid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolDevice {
    pub name: String,
    pub mac: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            tls_mode: TlsMode::default(),
            tls_cert: None,
            tls_key: None,
            web_root: default_web_root(),
            metrics_require_auth: false,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            bitrate_kbps: default_bitrate(),
            min_bitrate_kbps: default_min_bitrate(),
            max_bitrate_kbps: default_max_bitrate(),
            framerate: default_framerate(),
            max_width: default_max_width(),
            max_height: default_max_height(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_width: default_width(),
            default_height: default_height(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            keyboard_enabled: true,
            mouse_enabled: true,
            mass_storage_enabled: true,
        }
    }
}

impl Default for JigglerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule_seconds: default_jiggler_schedule_seconds(),
            inactivity_limit_seconds: default_inactivity_limit_seconds(),
            jitter_percentage: 0,
        }
    }
}

impl KvmConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, daemon should not start) or
    /// "WARNING:" (advisory). Never short-circuits — every violated rule is
    /// reported in one pass.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.http_port == 0 {
            issues.push("ERROR: server.http_port must be between 1 and 65535, got 0.".to_string());
        }

        match self.server.tls_mode {
            TlsMode::Custom => match (&self.server.tls_cert, &self.server.tls_key) {
                (Some(cert), Some(key)) => {
                    if !std::path::Path::new(cert).exists() {
                        issues.push(format!("ERROR: tls_cert '{cert}' does not exist."));
                    }
                    if !std::path::Path::new(key).exists() {
                        issues.push(format!("ERROR: tls_key '{key}' does not exist."));
                    }
                }
                _ => issues.push(
                    "ERROR: tls_mode=custom requires both tls_cert and tls_key to be set."
                        .to_string(),
                ),
            },
            TlsMode::Disabled | TlsMode::SelfSigned => {
                if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
                    issues.push(
                        "WARNING: tls_cert/tls_key set without the other, and tls_mode isn't custom — ignored."
                            .to_string(),
                    );
                }
            }
        }

        if self.video.bitrate_kbps > 100_000 {
            issues.push(format!(
                "WARNING: video.bitrate_kbps is {} — this is unusually high and may indicate a misconfiguration.",
                self.video.bitrate_kbps
            ));
        }

        if self.video.framerate == 0 || self.video.framerate > 240 {
            issues.push(format!(
                "ERROR: video.framerate must be between 1 and 240, got {}.",
                self.video.framerate
            ));
        }

        if self.video.max_width != 0 && self.video.max_width < 320 {
            issues.push(format!(
                "ERROR: video.max_width must be 0 (unlimited) or at least 320, got {}.",
                self.video.max_width
            ));
        }
        if self.video.max_height != 0 && self.video.max_height < 240 {
            issues.push(format!(
                "ERROR: video.max_height must be 0 (unlimited) or at least 240, got {}.",
                self.video.max_height
            ));
        }

        if self.session.idle_timeout_seconds > 0 && self.session.idle_timeout_seconds < 60 {
            issues.push(format!(
                "ERROR: session.idle_timeout_seconds must be 0 (disabled) or at least 60, got {}.",
                self.session.idle_timeout_seconds
            ));
        }

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{url}' must start with 'stun:' or 'stuns:'."
                ));
            }
        }
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{url}' must start with 'turn:' or 'turns:'."
                ));
            }
        }

        if self.auth.mode == AuthMode::Password && self.auth.password_hash.is_none() {
            issues.push(
                "WARNING: auth.mode=password but no password_hash is set yet (first-run setup pending)."
                    .to_string(),
            );
        }

        if self.jiggler.enabled && self.jiggler.inactivity_limit_seconds == 0 {
            issues.push(
                "ERROR: jiggler.enabled=true requires inactivity_limit_seconds >= 1.".to_string(),
            );
        }
        if self.jiggler.jitter_percentage > 100 {
            issues.push(format!(
                "ERROR: jiggler.jitter_percentage must be 0-100, got {}.",
                self.jiggler.jitter_percentage
            ));
        }

        for wol in &self.wol_devices {
            if !is_plausible_mac(&wol.mac) {
                issues.push(format!(
                    "WARNING: wol device '{}' has a malformed MAC address: {}",
                    wol.name, wol.mac
                ));
            }
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn is_plausible_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6 && parts.iter().all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn default_web_root() -> String {
    "./share/web".to_string()
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    80
}
fn default_https_port() -> u16 {
    443
}
fn default_bitrate() -> u32 {
    5000
}
fn default_min_bitrate() -> u32 {
    500
}
fn default_max_bitrate() -> u32 {
    20000
}
fn default_framerate() -> u32 {
    60
}
fn default_max_width() -> u32 {
    1920
}
fn default_max_height() -> u32 {
    1080
}
fn default_true() -> bool {
    true
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_idle_timeout() -> u32 {
    0
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_relay_url() -> String {
    "wss://cloud.kvmd.example/agent".to_string()
}
fn default_jiggler_schedule_seconds() -> u32 {
    20
}
fn default_inactivity_limit_seconds() -> u32 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_json() {
        let config: KvmConfig = serde_json::from_str("{}").expect("empty object should deserialize");

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.http_port, 80);
        assert_eq!(config.server.https_port, 443);
        assert!(config.server.tls_cert.is_none());
        assert!(config.server.tls_key.is_none());
        assert_eq!(config.server.web_root, "./share/web");
        assert!(!config.server.metrics_require_auth);

        assert_eq!(config.video.bitrate_kbps, 5000);
        assert_eq!(config.video.framerate, 60);
        assert_eq!(config.video.max_width, 1920);
        assert_eq!(config.video.max_height, 1080);

        assert_eq!(config.session.default_width, 1920);
        assert_eq!(config.session.idle_timeout_seconds, 0);

        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());

        assert!(config.usb.keyboard_enabled);
        assert!(config.usb.mass_storage_enabled);
        assert!(!config.jiggler.enabled);
        assert!(config.wol_devices.is_empty());
    }

    #[test]
    fn partial_config_only_video_section() {
        let json = r#"{"video": {"bitrate_kbps": 8000, "framerate": 30}}"#;
        let config: KvmConfig = serde_json::from_str(json).expect("partial config should deserialize");

        assert_eq!(config.video.bitrate_kbps, 8000);
        assert_eq!(config.video.framerate, 30);
        assert_eq!(config.video.min_bitrate_kbps, 500);
        assert_eq!(config.server.http_port, 80);
        assert_eq!(config.session.default_width, 1920);
    }

    #[test]
    fn idle_timeout_zero_works() {
        let json = r#"{"session": {"idle_timeout_seconds": 0}}"#;
        let config: KvmConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.session.idle_timeout_seconds, 0);
        assert_eq!(config.session.default_width, 1920);
    }

    #[test]
    fn max_width_and_max_height_zero_works() {
        let json = r#"{"video": {"max_width": 0, "max_height": 0}}"#;
        let config: KvmConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.video.max_width, 0);
        assert_eq!(config.video.max_height, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn custom_values_override_defaults() {
        let json = r#"{
            "server": {"bind": "127.0.0.1", "http_port": 8080, "https_port": 0, "tls_mode": "disabled"},
            "video": {"bitrate_kbps": 10000, "framerate": 120},
            "session": {"default_width": 2560, "default_height": 1440, "idle_timeout_seconds": 7200},
            "ice": {"stun_urls": ["stun:custom.example.com:3478"], "turn_urls": ["turn:turn.example.com:3478"], "turn_username": "user", "turn_credential": "pass"},
            "jiggler": {"enabled": true, "inactivity_limit_seconds": 120}
        }"#;
        let config: KvmConfig = serde_json::from_str(json).expect("full custom config should deserialize");

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.https_port, 0);
        assert_eq!(config.video.bitrate_kbps, 10000);
        assert_eq!(config.video.framerate, 120);
        assert_eq!(config.session.default_width, 2560);
        assert_eq!(config.session.idle_timeout_seconds, 7200);
        assert_eq!(config.ice.stun_urls, vec!["stun:custom.example.com:3478"]);
        assert_eq!(config.ice.turn_username.as_deref(), Some("user"));
        assert!(config.jiggler.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_trait_matches_empty_json() {
        let from_json: KvmConfig = serde_json::from_str("{}").expect("empty object should deserialize");
        let from_default = KvmConfig::default();

        assert_eq!(from_default.server.bind, from_json.server.bind);
        assert_eq!(from_default.server.http_port, from_json.server.http_port);
        assert_eq!(from_default.server.https_port, from_json.server.https_port);
        assert_eq!(from_default.video.bitrate_kbps, from_json.video.bitrate_kbps);
        assert_eq!(from_default.video.framerate, from_json.video.framerate);
        assert_eq!(from_default.session.default_width, from_json.session.default_width);
        assert_eq!(from_default.ice.stun_urls, from_json.ice.stun_urls);
        assert_eq!(from_default.usb.mass_storage_enabled, from_json.usb.mass_storage_enabled);
        assert_eq!(from_default.jiggler.schedule_seconds, from_json.jiggler.schedule_seconds);
    }

    fn valid_config() -> KvmConfig {
        KvmConfig::default()
    }

    fn validate_issues(config: &KvmConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues.iter().any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues.iter().any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_http_port_zero_is_error() {
        let mut config = valid_config();
        config.server.http_port = 0;
        assert!(has_error(&validate_issues(&config), "http_port"));
    }

    #[test]
    fn validate_custom_tls_missing_files_is_error() {
        let mut config = valid_config();
        config.server.tls_mode = TlsMode::Custom;
        config.server.tls_cert = Some("/nonexistent/cert.pem".to_string());
        config.server.tls_key = Some("/nonexistent/key.pem".to_string());
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "tls_cert"));
        assert!(has_error(&issues, "tls_key"));
    }

    #[test]
    fn validate_custom_tls_without_paths_is_error() {
        let mut config = valid_config();
        config.server.tls_mode = TlsMode::Custom;
        let issues = validate_issues(&config);
        assert!(issues.iter().any(|i| i.contains("tls_mode=custom")));
    }

    #[test]
    fn validate_self_signed_mode_ignores_missing_cert_pair() {
        let config = valid_config();
        assert_eq!(config.server.tls_mode, TlsMode::SelfSigned);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_bitrate_over_100k_is_warning_not_error() {
        let mut config = valid_config();
        config.video.bitrate_kbps = 100_001;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "bitrate_kbps"));
        assert!(!has_error(&issues, "bitrate_kbps"));
    }

    #[test]
    fn validate_framerate_zero_is_error() {
        let mut config = valid_config();
        config.video.framerate = 0;
        assert!(has_error(&validate_issues(&config), "framerate"));
    }

    #[test]
    fn validate_framerate_241_is_error() {
        let mut config = valid_config();
        config.video.framerate = 241;
        assert!(has_error(&validate_issues(&config), "framerate"));
    }

    #[test]
    fn validate_framerate_240_is_ok() {
        let mut config = valid_config();
        config.video.framerate = 240;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_max_width_too_small_is_error() {
        let mut config = valid_config();
        config.video.max_width = 319;
        assert!(has_error(&validate_issues(&config), "max_width"));
    }

    #[test]
    fn validate_max_width_zero_is_ok() {
        let mut config = valid_config();
        config.video.max_width = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_idle_timeout_59_is_error() {
        let mut config = valid_config();
        config.session.idle_timeout_seconds = 59;
        assert!(has_error(&validate_issues(&config), "idle_timeout"));
    }

    #[test]
    fn validate_idle_timeout_60_is_ok() {
        let mut config = valid_config();
        config.session.idle_timeout_seconds = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_stun_url_bad_prefix_is_error() {
        let mut config = valid_config();
        config.ice.stun_urls = vec!["http://stun.example.com:3478".to_string()];
        assert!(has_error(&validate_issues(&config), "STUN URL"));
    }

    #[test]
    fn validate_turn_url_turns_prefix_is_ok() {
        let mut config = valid_config();
        config.ice.turn_urls = vec!["turns:turn.example.com:5349".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_password_mode_without_hash_is_warning_not_error() {
        let mut config = valid_config();
        config.auth.mode = AuthMode::Password;
        let issues = validate_issues(&config);
        assert!(issues.iter().all(|i| i.starts_with("WARNING:")));
        assert!(has_warning(&issues, "password_hash"));
    }

    #[test]
    fn validate_jiggler_enabled_zero_inactivity_is_error() {
        let mut config = valid_config();
        config.jiggler.enabled = true;
        config.jiggler.inactivity_limit_seconds = 0;
        assert!(has_error(&validate_issues(&config), "jiggler"));
    }

    #[test]
    fn validate_jiggler_jitter_over_100_is_error() {
        let mut config = valid_config();
        config.jiggler.jitter_percentage = 101;
        assert!(has_error(&validate_issues(&config), "jitter_percentage"));
    }

    #[test]
    fn validate_malformed_wol_mac_is_warning() {
        let mut config = valid_config();
        config.wol_devices.push(WolDevice {
            name: "desktop".to_string(),
            mac: "not-a-mac".to_string(),
        });
        assert!(has_warning(&validate_issues(&config), "desktop"));
    }

    #[test]
    fn validate_well_formed_wol_mac_is_ok() {
        let mut config = valid_config();
        config.wol_devices.push(WolDevice {
            name: "desktop".to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut config = valid_config();
        config.server.http_port = 0;
        config.video.framerate = 0;
        config.session.idle_timeout_seconds = 30;
        let issues = validate_issues(&config);
        assert!(issues.len() >= 3, "expected at least 3 issues, got {issues:?}");
    }

    #[test]
    fn auth_config_debug_redacts_secrets() {
        let mut auth = AuthConfig::default();
        auth.password_hash = Some("$argon2id$v=19$...".to_string());
        auth.cookie_secret = Some("supersecretvalue".to_string());
        let debug_str = format!("{auth:?}");
        assert!(!debug_str.contains("supersecretvalue"));
        assert!(!debug_str.contains("argon2id$v=19"));
        assert!(debug_str.contains("[SET]"));
    }

    #[test]
    fn json_roundtrip_preserves_cloud_fields() {
        let mut config = KvmConfig::default();
        config.cloud.token = Some("tok123".to_string());
        config.cloud.google_identity = Some("client123:subject456".to_string());
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: KvmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.cloud.token, config.cloud.token);
        assert_eq!(parsed.cloud.google_identity, config.cloud.google_identity);
    }
}
