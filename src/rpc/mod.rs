//! Bidirectional JSON-RPC 2.0 engine carried over a single WebSocket text
//! stream.
//!
//! Grounded on the pending-call correlation pattern in `ethers-providers`'s
//! `ws::manager::RequestManager`: a monotonic id counter, a map from id to
//! an in-flight oneshot sender, resolved when a matching response arrives.
//! Unlike that HTTP/WS JSON-RPC client, calls can originate from either
//! side of the connection, so the engine also holds a method registry for
//! calls the control plane initiates against us.

pub mod message;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use message::{
    parse_incoming, Incoming, JsonRpcError, JsonRpcRequest, JsonRpcResponse, JsonRpcResponseIn,
};

#[derive(Debug, Error, Clone)]
pub enum RpcError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("connection closed before a response arrived")]
    Closed,

    #[error("peer returned error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("malformed JSON-RPC frame: {0}")]
    Malformed(String),
}

impl From<JsonRpcError> for RpcError {
    fn from(e: JsonRpcError) -> Self {
        RpcError::Remote {
            code: e.code,
            message: e.message,
        }
    }
}

impl From<&RpcError> for JsonRpcError {
    fn from(e: &RpcError) -> Self {
        match e {
            RpcError::MethodNotFound(m) => JsonRpcError::method_not_found(m),
            RpcError::InvalidParams(m) => JsonRpcError::invalid_params(m.clone()),
            other => JsonRpcError::internal(other.to_string()),
        }
    }
}

pub type MethodResult = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;
pub type MethodHandler = Arc<dyn Fn(Value, CancellationToken) -> MethodResult + Send + Sync>;

/// Bidirectional JSON-RPC engine: owns the pending-call table and the
/// inbound method registry, and serializes all outbound frames through a
/// single mpsc channel so only one task ever writes to the socket.
pub struct RpcEngine {
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>,
    methods: RwLock<HashMap<String, MethodHandler>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl RpcEngine {
    /// `outbound` is drained by the tunnel's writer task; text frames sent
    /// on it are written verbatim to the WebSocket.
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            methods: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        })
    }

    /// Register a handler the peer can invoke by name. Re-registering a
    /// name replaces the previous handler. Synchronous so it can be called
    /// from a plain setup closure re-run after every reconnect. The handler
    /// receives a token derived from the engine's own cancellation token,
    /// cancelled when [`RpcEngine::close`] runs.
    pub fn add_method<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let boxed: MethodHandler = Arc::new(move |params, token| Box::pin(handler(params, token)));
        self.methods
            .write()
            .expect("method registry lock poisoned")
            .insert(name.into(), boxed);
    }

    /// Issue an outbound call and wait for the correlated response.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        let text = serde_json::to_string(&request)
            .map_err(|e| RpcError::Internal(format!("failed to encode request: {e}")))?;

        if self.outbound.send(text).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::Closed);
        }

        rx.await.unwrap_or(Err(RpcError::Closed))
    }

    /// Feed one inbound text frame to the engine: either resolves a
    /// pending call, or dispatches to a registered method and writes the
    /// response back out.
    pub async fn handle_incoming(self: &Arc<Self>, text: &str) {
        match parse_incoming(text) {
            Ok(Incoming::Response(resp)) => self.resolve(resp).await,
            Ok(Incoming::Request(req)) => self.dispatch(req).await,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed JSON-RPC frame");
            }
        }
    }

    async fn resolve(&self, resp: JsonRpcResponseIn) {
        let Some(tx) = self.pending.lock().await.remove(&resp.id) else {
            tracing::warn!(id = resp.id, "response for unknown or already-resolved call");
            return;
        };

        let outcome = match (resp.result, resp.error) {
            (Some(result), None) => Ok(result),
            (_, Some(err)) => Err(RpcError::from(err)),
            (None, None) => Ok(Value::Null),
        };
        let _ = tx.send(outcome);
    }

    /// Spawns each inbound request onto its own task so a slow handler
    /// (a provisioning op, say) never blocks the reader from pumping the
    /// next frame off the wire -- notably the heartbeat's own responses.
    async fn dispatch(self: &Arc<Self>, req: message::JsonRpcRequestIn) {
        let handler = self
            .methods
            .read()
            .expect("method registry lock poisoned")
            .get(&req.method)
            .cloned();
        let token = self.cancel.child_token();
        let engine = Arc::clone(self);
        let method = req.method;

        tokio::spawn(async move {
            let Some(id) = req.id else {
                // Notification (no id): run the handler if present, but
                // there's nothing to reply to.
                if let Some(handler) = handler {
                    let _ = handler(req.params.unwrap_or(Value::Null), token).await;
                }
                return;
            };

            let response = match handler {
                Some(handler) => match handler(req.params.unwrap_or(Value::Null), token).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => JsonRpcResponse::failure(id, JsonRpcError::from(&e)),
                },
                None => JsonRpcResponse::failure(id, JsonRpcError::method_not_found(&method)),
            };

            if let Ok(text) = serde_json::to_string(&response) {
                let _ = engine.outbound.send(text);
            }
        });
    }

    /// Reject every in-flight call and cancel every in-flight inbound
    /// handler task. Called when the tunnel drops so callers blocked in
    /// [`RpcEngine::call`] don't hang until timeout.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(RpcError::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine_with_loopback() -> (Arc<RpcEngine>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RpcEngine::new(tx), rx)
    }

    #[tokio::test]
    async fn call_resolves_on_matching_response() {
        let (engine, mut rx) = engine_with_loopback();
        let engine2 = engine.clone();

        let call = tokio::spawn(async move { engine2.call("ping", None).await });

        let sent = rx.recv().await.unwrap();
        let req: Value = serde_json::from_str(&sent).unwrap();
        let id = req["id"].as_u64().unwrap();

        engine
            .handle_incoming(&json!({"jsonrpc":"2.0","id": id, "result": "pong"}).to_string())
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn unregistered_method_returns_method_not_found() {
        let (engine, mut rx) = engine_with_loopback();
        engine
            .handle_incoming(&json!({"jsonrpc":"2.0","id": 7, "method": "nope"}).to_string())
            .await;

        let sent = rx.recv().await.unwrap();
        let resp: Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(resp["error"]["code"], json!(message::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn registered_method_is_invoked_and_replies() {
        let (engine, mut rx) = engine_with_loopback();
        engine.add_method("echo", |params, _cancel| async move { Ok(params) });

        engine
            .handle_incoming(
                &json!({"jsonrpc":"2.0","id": 1, "method": "echo", "params": {"a": 1}})
                    .to_string(),
            )
            .await;

        let sent = rx.recv().await.unwrap();
        let resp: Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(resp["result"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn close_cancels_handler_tokens() {
        let (engine, mut rx) = engine_with_loopback();
        let (saw_cancel_tx, saw_cancel_rx) = oneshot::channel();
        let saw_cancel_tx = std::sync::Mutex::new(Some(saw_cancel_tx));

        engine.add_method("wait", move |_params, cancel| {
            let tx = saw_cancel_tx.lock().unwrap().take();
            async move {
                cancel.cancelled().await;
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
                Ok(Value::Null)
            }
        });

        engine
            .handle_incoming(&json!({"jsonrpc":"2.0","id": 9, "method": "wait"}).to_string())
            .await;
        engine.close().await;

        saw_cancel_rx.await.unwrap();
        // The handler task still writes its (now-moot) response; drain it
        // so the channel doesn't just leak for the rest of the test run.
        let _ = rx.recv().await;
    }

    #[tokio::test]
    async fn close_cancels_pending_calls() {
        let (engine, _rx) = engine_with_loopback();
        let engine2 = engine.clone();

        let call = tokio::spawn(async move { engine2.call("slow", None).await });
        tokio::task::yield_now().await;
        engine.close().await;

        assert!(matches!(call.await.unwrap(), Err(RpcError::Closed)));
    }
}
