//! JSON-RPC Router (C2): a static per-method dispatch table with hand-written
//! typed adapters, reflection-free by design. Wraps handler invocation so a
//! panic inside one handler becomes an internal-error response rather than
//! taking down the data channel it's dispatched on.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kvmd_protocol::{
    JsonRpcError, JsonRpcEvent, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR,
    METHOD_NOT_FOUND,
};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, JsonRpcError>> + Send>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(5);

/// Extract a required parameter and coerce it to `u8`, rejecting out-of-range
/// values with `INVALID_PARAMS` rather than silently truncating — used for
/// HID report fields (modifiers, button masks, keycodes) that are always
/// byte-valued on the wire.
pub fn require_byte_field(params: &Value, field: &str) -> Result<u8, JsonRpcError> {
    let raw = params
        .get(field)
        .ok_or_else(|| JsonRpcError::invalid_params(format!("missing field: {field}")))?;
    let n = raw
        .as_i64()
        .ok_or_else(|| JsonRpcError::invalid_params(format!("field {field} must be a number")))?;
    if !(0..=255).contains(&n) {
        return Err(JsonRpcError::invalid_params(format!(
            "field {field} must be in range [0,255], got {n}"
        )));
    }
    Ok(n as u8)
}

/// Registry of method handlers plus the table of outbound requests this side
/// initiated and is awaiting a reply for. One `Router` is shared by every
/// session's `rpc` data channel.
pub struct Router {
    handlers: HashMap<String, Handler>,
    next_outbound_id: AtomicI64,
    outbound: Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
}

pub struct RouterBuilder {
    handlers: HashMap<String, Handler>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// Register a method with an async handler. `F` returns a future that
    /// resolves to the JSON result (or error) for that single call.
    pub fn method<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JsonRpcError>> + Send + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(move |params| Box::pin(handler(params))));
        self
    }

    pub fn build(self) -> Router {
        Router {
            handlers: self.handlers,
            next_outbound_id: AtomicI64::new(1),
            outbound: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What the caller should do with the outcome of `dispatch`.
pub enum Dispatched {
    /// Send this text back over the data channel.
    Reply(String),
    /// An inbound event was handled; nothing to send back.
    EventHandled,
    /// A response to one of our own outbound requests was delivered to its
    /// waiter (or silently dropped if nobody was waiting / it timed out).
    ResponseDelivered,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Decode and act on one inbound text frame from a data channel.
    pub async fn dispatch(&self, raw: &str) -> Dispatched {
        match JsonRpcMessage::classify(raw) {
            Ok(JsonRpcMessage::Request(req)) => Dispatched::Reply(self.dispatch_request(req).await),
            Ok(JsonRpcMessage::Event(event)) => {
                tracing::debug!(method = %event.method, "Received event on rpc channel");
                Dispatched::EventHandled
            }
            Ok(JsonRpcMessage::Response(resp)) => {
                self.resolve_outbound(resp).await;
                Dispatched::ResponseDelivered
            }
            Err(e) => {
                let reply = JsonRpcResponse::err(Value::Null, e);
                Dispatched::Reply(serde_json::to_string(&reply).unwrap_or_default())
            }
        }
    }

    async fn dispatch_request(&self, req: JsonRpcRequest) -> String {
        let id = req.id.clone();
        let Some(handler) = self.handlers.get(&req.method).cloned() else {
            let resp = JsonRpcResponse::err(id, JsonRpcError::method_not_found(&req.method));
            return serde_json::to_string(&resp).unwrap_or_default();
        };

        // Handlers run on a dedicated task; a panic inside one surfaces as a
        // `JoinError` rather than taking the whole dispatcher down, so it's
        // caught at this boundary and turned into an internal-error response.
        let outcome = tokio::spawn(handler(req.params)).await;

        let resp = match outcome {
            Ok(Ok(result)) => JsonRpcResponse::ok(id, result),
            Ok(Err(err)) => JsonRpcResponse::err(id, err),
            Err(join_err) => {
                let message = if join_err.is_panic() { "handler panicked".to_string() } else { join_err.to_string() };
                tracing::error!(method = %req.method, %message, "RPC handler failed");
                JsonRpcResponse::err(id, JsonRpcError { code: INTERNAL_ERROR, message, data: None })
            }
        };
        serde_json::to_string(&resp).unwrap_or_else(|_| {
            let fallback = JsonRpcResponse::err(
                Value::Null,
                JsonRpcError::internal_error("failed to serialize response"),
            );
            serde_json::to_string(&fallback).unwrap_or_default()
        })
    }

    async fn resolve_outbound(&self, resp: JsonRpcResponse) {
        let Some(id) = resp.id.as_i64() else { return };
        if let Some(tx) = self.outbound.lock().await.remove(&id) {
            let _ = tx.send(resp);
        }
    }

    /// Send an event (one-way notification) — used for `videoInputState`,
    /// `otherSessionConnected`, `networkState`, `usbState`.
    pub fn encode_event(method: &str, params: Value) -> String {
        let event = JsonRpcEvent::new(method, params);
        serde_json::to_string(&event).unwrap_or_default()
    }

    /// Issue an outbound request and await its reply with a monotonic id,
    /// timing out after 5s if the peer never answers.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        send: impl FnOnce(String),
    ) -> Result<Value, JsonRpcError> {
        let id = self.next_outbound_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.outbound.lock().await.insert(id, tx);

        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Value::from(id),
        };
        send(serde_json::to_string(&req).unwrap_or_default());

        match tokio::time::timeout(OUTBOUND_TIMEOUT, rx).await {
            Ok(Ok(resp)) => match resp.error {
                Some(err) => Err(err),
                None => Ok(resp.result.unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(JsonRpcError::internal_error("outbound request cancelled")),
            Err(_) => {
                self.outbound.lock().await.remove(&id);
                Err(JsonRpcError::internal_error("outbound request timed out"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispatch_request_routes_to_registered_handler() {
        let router = Router::builder()
            .method("ping", |_params| async { Ok(json!("pong")) })
            .build();

        let reply = router
            .dispatch(r#"{"jsonrpc":"2.0","method":"ping","params":{},"id":1}"#)
            .await;
        let Dispatched::Reply(text) = reply else { panic!("expected reply") };
        let resp: JsonRpcResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(resp.result, Some(json!("pong")));
    }

    #[tokio::test]
    async fn dispatch_unknown_method_returns_method_not_found() {
        let router = Router::builder().build();
        let reply = router
            .dispatch(r#"{"jsonrpc":"2.0","method":"nope","params":{},"id":1}"#)
            .await;
        let Dispatched::Reply(text) = reply else { panic!("expected reply") };
        let resp: JsonRpcResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn dispatch_catches_handler_panic() {
        let router = Router::builder()
            .method("boom", |_params| async { panic!("kaboom") })
            .build();
        let reply = router
            .dispatch(r#"{"jsonrpc":"2.0","method":"boom","params":{},"id":5}"#)
            .await;
        let Dispatched::Reply(text) = reply else { panic!("expected reply") };
        let resp: JsonRpcResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(resp.error.unwrap().code, INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn dispatch_event_has_no_reply() {
        let router = Router::builder().build();
        let outcome = router
            .dispatch(r#"{"jsonrpc":"2.0","method":"videoInputState","params":{"ready":true}}"#)
            .await;
        assert!(matches!(outcome, Dispatched::EventHandled));
    }

    #[test]
    fn require_byte_field_rejects_out_of_range() {
        let params = json!({"modifier": 300});
        let err = require_byte_field(&params, "modifier").unwrap_err();
        assert_eq!(err.code, kvmd_protocol::INVALID_PARAMS);
    }

    #[test]
    fn require_byte_field_rejects_missing() {
        let params = json!({});
        let err = require_byte_field(&params, "modifier").unwrap_err();
        assert_eq!(err.code, kvmd_protocol::INVALID_PARAMS);
    }

    #[test]
    fn require_byte_field_accepts_boundary_values() {
        let params = json!({"a": 0, "b": 255});
        assert_eq!(require_byte_field(&params, "a").unwrap(), 0);
        assert_eq!(require_byte_field(&params, "b").unwrap(), 255);
    }

    #[tokio::test]
    async fn outbound_call_resolves_via_dispatch() {
        let router = Arc::new(Router::builder().build());
        let router2 = Arc::clone(&router);

        let call_task = tokio::spawn(async move {
            router2.call("getClipboard", json!({}), |_text| {}).await
        });

        // Give the call a moment to register its waiter, then simulate the
        // peer's reply arriving back through dispatch().
        tokio::task::yield_now().await;
        let reply = router
            .dispatch(r#"{"jsonrpc":"2.0","result":"hello","id":1}"#)
            .await;
        assert!(matches!(reply, Dispatched::ResponseDelivered));

        let result = call_task.await.unwrap().unwrap();
        assert_eq!(result, json!("hello"));
    }
}
