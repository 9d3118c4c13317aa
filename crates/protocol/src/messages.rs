use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// JSON-RPC 2.0 request: identified by the presence of `method` and `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Value,
}

/// JSON-RPC 2.0 success/error response: identified by `id` with no `method`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn err(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// JSON-RPC 2.0 notification (event): no `id` at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcEvent {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcEvent {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INTERNAL_ERROR: i32 = -32603;
pub const INVALID_PARAMS: i32 = -32602;

impl JsonRpcError {
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self { code: PARSE_ERROR, message: detail.into(), data: None }
    }
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }
    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self { code: INTERNAL_ERROR, message: detail.into(), data: None }
    }
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self { code: INVALID_PARAMS, message: detail.into(), data: None }
    }
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

/// Which of the three JSON-RPC wire shapes a raw text frame parses as.
#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Event(JsonRpcEvent),
}

impl JsonRpcMessage {
    /// Classify a raw JSON value: `method` + `id` present means request,
    /// `method` alone means event (notification), `id` alone means response.
    pub fn classify(raw: &str) -> Result<Self, JsonRpcError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| JsonRpcError::parse_error(e.to_string()))?;
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some();

        if has_method && has_id {
            serde_json::from_value(value)
                .map(JsonRpcMessage::Request)
                .map_err(|e| JsonRpcError::parse_error(e.to_string()))
        } else if has_method {
            serde_json::from_value(value)
                .map(JsonRpcMessage::Event)
                .map_err(|e| JsonRpcError::parse_error(e.to_string()))
        } else if has_id {
            serde_json::from_value(value)
                .map(JsonRpcMessage::Response)
                .map_err(|e| JsonRpcError::parse_error(e.to_string()))
        } else {
            Err(JsonRpcError::parse_error("message has neither method nor id"))
        }
    }
}

/// Signaling envelope carried inside `rpc` data-channel method params /
/// returned via events, used to bootstrap and maintain the WebRTC session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcSessionRequest {
    #[serde(rename = "sd")]
    pub sdp: String,
    /// Google ID token presented by the cloud relay path; absent on LAN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_google: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub ice_servers: Vec<IceServerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcSessionAnswer {
    #[serde(rename = "sd")]
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// ICE server configuration returned to the browser via `GET /api/ice-servers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Authentication request against the local-auth HTTP surface.
#[derive(Serialize, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest").field("password", &"[REDACTED]").finish()
    }
}

/// Information about the single current session, surfaced via RPC/HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub width: u32,
    pub height: u32,
    pub created_at: u64,
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_request_needs_method_and_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"getVirtualMediaState","params":{},"id":1}"#;
        match JsonRpcMessage::classify(raw).unwrap() {
            JsonRpcMessage::Request(req) => {
                assert_eq!(req.method, "getVirtualMediaState");
                assert_eq!(req.id, json!(1));
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn classify_event_has_method_no_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"videoStateChanged","params":{"ready":true}}"#;
        match JsonRpcMessage::classify(raw).unwrap() {
            JsonRpcMessage::Event(ev) => assert_eq!(ev.method, "videoStateChanged"),
            other => panic!("expected Event, got {other:?}"),
        }
    }

    #[test]
    fn classify_response_has_id_no_method() {
        let raw = r#"{"jsonrpc":"2.0","result":{"ok":true},"id":7}"#;
        match JsonRpcMessage::classify(raw).unwrap() {
            JsonRpcMessage::Response(resp) => {
                assert_eq!(resp.id, json!(7));
                assert!(resp.error.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn classify_neither_is_parse_error() {
        let raw = r#"{"jsonrpc":"2.0"}"#;
        let err = JsonRpcMessage::classify(raw).unwrap_err();
        assert_eq!(err.code, PARSE_ERROR);
    }

    #[test]
    fn classify_garbage_is_parse_error() {
        let err = JsonRpcMessage::classify("not json at all").unwrap_err();
        assert_eq!(err.code, PARSE_ERROR);
    }

    #[test]
    fn error_constructors_use_standard_codes() {
        assert_eq!(JsonRpcError::method_not_found("foo").code, METHOD_NOT_FOUND);
        assert_eq!(JsonRpcError::invalid_params("bad").code, INVALID_PARAMS);
        assert_eq!(JsonRpcError::internal_error("boom").code, INTERNAL_ERROR);
        assert_eq!(JsonRpcError::parse_error("x").code, PARSE_ERROR);
    }

    #[test]
    fn response_ok_omits_error_field() {
        let resp = JsonRpcResponse::ok(json!(1), json!({"ready": true}));
        let json_str = serde_json::to_string(&resp).unwrap();
        assert!(json_str.contains(r#""result""#));
        assert!(!json_str.contains("\"error\""));
    }

    #[test]
    fn response_err_omits_result_field() {
        let resp = JsonRpcResponse::err(json!(1), JsonRpcError::method_not_found("bogus"));
        let json_str = serde_json::to_string(&resp).unwrap();
        assert!(json_str.contains(r#""error""#));
        assert!(!json_str.contains("\"result\""));
    }

    #[test]
    fn login_request_debug_redacts_password() {
        let req = LoginRequest { password: "hunter2".to_string() };
        let debug_str = format!("{req:?}");
        assert!(!debug_str.contains("hunter2"));
        assert!(debug_str.contains("[REDACTED]"));
    }

    #[test]
    fn ice_candidate_init_roundtrip() {
        let candidate = IceCandidateInit {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json_str = serde_json::to_string(&candidate).unwrap();
        let parsed: IceCandidateInit = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.candidate, candidate.candidate);
        assert_eq!(parsed.sdp_mline_index, Some(0));
    }
}
