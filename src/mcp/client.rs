// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Enhanced Client: correlated request/response over any [`Transport`].
//!
//! Every request gets a fresh numeric id and a pending entry. A router task
//! consumes the transport's events and settles entries by id; the caller
//! races that settlement against `request_timeout`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine_core::constants::{client as defaults, jsonrpc, methods, protocol};
use crate::engine_core::errors::{McpError, McpResult};
use crate::engine_core::models::{JsonRpcRequest, RequestId, ToolDefinition};
use crate::mcp::transport::{Transport, TransportConfig, TransportEvent};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How long a call waits for its response.
    pub request_timeout: Duration,
    /// Extra attempts after a failed `send`. Timeouts are never retried.
    pub max_retries: u32,
    /// Uncorrelated transport errors only fail calls older than this.
    pub error_grace: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(defaults::DEFAULT_REQUEST_TIMEOUT_MS),
            max_retries: defaults::DEFAULT_MAX_RETRIES,
            error_grace: Duration::from_millis(defaults::DEFAULT_ERROR_GRACE_MS),
        }
    }
}

impl ClientOptions {
    /// Takes `timeoutMs` from the transport config. `maxRetries` is honoured
    /// for stdio only; the HTTP transport already retries on its own.
    pub fn from_transport_config(config: &TransportConfig) -> Self {
        let mut options = Self::default();
        if let Some(ms) = config.timeout_ms() {
            options.request_timeout = Duration::from_millis(ms);
        }
        if let TransportConfig::Stdio(stdio) = config {
            options.max_retries = stdio.max_retries.unwrap_or(defaults::DEFAULT_MAX_RETRIES);
        }
        options
    }
}

struct PendingCall {
    created_at: Instant,
    responder: oneshot::Sender<McpResult<Value>>,
}

type PendingMap = Arc<Mutex<HashMap<RequestId, PendingCall>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<RequestId, PendingCall>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the pending entry when the call future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

enum CallError {
    Send(McpError),
    Settled(McpError),
}

pub struct EnhancedClient {
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    pending: PendingMap,
    next_id: AtomicI64,
    closed: AtomicBool,
    router: Mutex<Option<JoinHandle<()>>>,
    notifications_tx: mpsc::Sender<Value>,
    notifications_rx: Mutex<Option<mpsc::Receiver<Value>>>,
}

impl EnhancedClient {
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        let (notifications_tx, notifications_rx) = mpsc::channel(64);
        Self {
            transport,
            options,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            router: Mutex::new(None),
            notifications_tx,
            notifications_rx: Mutex::new(Some(notifications_rx)),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Server-initiated notifications. Only the first caller gets the receiver.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<Value>> {
        self.notifications_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub async fn connect(&self) -> McpResult<()> {
        self.ensure_open()?;
        self.ensure_router()?;
        self.transport.connect().await
    }

    /// Sends `method` and waits for the matching response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.ensure_open()?;
        self.ensure_router()?;

        let mut attempt = 0u32;
        loop {
            match self.request_once(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(CallError::Send(err @ McpError::Transport(_)))
                    if attempt < self.options.max_retries =>
                {
                    attempt += 1;
                    warn!(method, attempt, "Send failed ({}); retrying", err);
                }
                Err(CallError::Send(err)) | Err(CallError::Settled(err)) => return Err(err),
            }
        }
    }

    async fn request_once(&self, method: &str, params: Option<Value>) -> Result<Value, CallError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (responder, response) = oneshot::channel();
        lock(&self.pending).insert(
            id.clone(),
            PendingCall {
                created_at: Instant::now(),
                responder,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        let request = JsonRpcRequest::new(id.clone(), method, params);
        let envelope = serde_json::to_value(&request).map_err(|e| {
            CallError::Settled(McpError::Validation(format!("Failed to serialize request: {}", e)))
        })?;

        let exchange = async {
            self.transport
                .send(&envelope)
                .await
                .map_err(CallError::Send)?;
            match response.await {
                Ok(result) => result.map_err(CallError::Settled),
                Err(_) => Err(CallError::Settled(McpError::Closed)),
            }
        };

        match tokio::time::timeout(self.options.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%id, method, "Request timed out");
                Err(CallError::Settled(McpError::Timeout(
                    self.options.request_timeout,
                )))
            }
        }
    }

    /// Fire-and-forget notification; nothing is awaited beyond the write.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.ensure_open()?;
        let envelope = serde_json::to_value(JsonRpcRequest::notification(method, params))
            .map_err(|e| McpError::Validation(format!("Failed to serialize notification: {}", e)))?;
        self.transport.send(&envelope).await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<Value> {
        self.request(
            methods::TOOLS_CALL,
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    pub async fn list_tools(&self) -> McpResult<Vec<ToolDefinition>> {
        let result = self.request(methods::TOOLS_LIST, Some(json!({}))).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(tools)
            .map_err(|e| McpError::Validation(format!("Invalid tools/list result: {}", e)))
    }

    /// Runs the `initialize` handshake and acknowledges it.
    pub async fn initialize(&self, client_name: &str, client_version: &str) -> McpResult<Value> {
        let result = self
            .request(
                methods::INITIALIZE,
                Some(json!({
                    "protocolVersion": protocol::LATEST,
                    "capabilities": {},
                    "clientInfo": { "name": client_name, "version": client_version },
                })),
            )
            .await?;
        self.notify(methods::NOTIFICATIONS_INITIALIZED, None).await?;
        info!(
            server = ?result.get("serverInfo"),
            version = ?result.get("protocolVersion"),
            "MCP session initialized"
        );
        Ok(result)
    }

    /// Rejects pending calls with [`McpError::Closed`] and disconnects.
    ///
    /// Safe to call more than once; every call attempts the disconnect.
    pub async fn close(&self) -> McpResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(transport = self.transport.kind(), "Closing client");
        }
        reject_all(&self.pending, || McpError::Closed);
        if let Some(router) = self.router.lock().ok().and_then(|mut r| r.take()) {
            router.abort();
        }
        self.transport.disconnect().await
    }

    fn ensure_open(&self) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        Ok(())
    }

    fn ensure_router(&self) -> McpResult<()> {
        let mut router = self
            .router
            .lock()
            .map_err(|_| McpError::Transport("client router lock poisoned".to_string()))?;
        if router.is_some() {
            return Ok(());
        }
        let events = self.transport.take_events().ok_or_else(|| {
            McpError::Transport("transport events are already consumed elsewhere".to_string())
        })?;
        *router = Some(tokio::spawn(route_events(
            events,
            self.pending.clone(),
            self.options.error_grace,
            self.notifications_tx.clone(),
        )));
        Ok(())
    }
}

impl Drop for EnhancedClient {
    fn drop(&mut self) {
        if let Some(router) = self.router.get_mut().ok().and_then(Option::take) {
            router.abort();
        }
    }
}

async fn route_events(
    mut events: mpsc::Receiver<TransportEvent>,
    pending: PendingMap,
    error_grace: Duration,
    notifications: mpsc::Sender<Value>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(value) => route_message(value, &pending, &notifications),
            TransportEvent::Error(err) => reject_stale(&pending, error_grace, &err),
            TransportEvent::Exit { code, signal } => {
                reject_all(&pending, || {
                    McpError::Transport(format!(
                        "Upstream exited (code {:?}, signal {:?})",
                        code, signal
                    ))
                });
            }
        }
    }
    reject_all(&pending, || {
        McpError::Transport("transport event stream closed".to_string())
    });
}

fn route_message(value: Value, pending: &PendingMap, notifications: &mpsc::Sender<Value>) {
    let id = value.get("id").and_then(RequestId::from_value);
    let has_method = value.get("method").is_some();

    let id = match (id, has_method) {
        (Some(id), false) => id,
        (None, true) => {
            if notifications.try_send(value).is_err() {
                debug!("Dropping server notification: no listener or queue full");
            }
            return;
        }
        (Some(id), true) => {
            debug!(%id, "Ignoring server-initiated request");
            return;
        }
        (None, false) => {
            debug!("Dropping message without id or method");
            return;
        }
    };

    let Some(call) = lock(pending).remove(&id) else {
        debug!(%id, "Dropping response for unknown or settled id");
        return;
    };

    let outcome = match value.get("error") {
        Some(error) => Err(McpError::Remote {
            code: error
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok())
                .unwrap_or(jsonrpc::ERROR_INTERNAL),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
            data: error.get("data").cloned(),
        }),
        None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
    };
    // The caller may already have timed out; that is fine.
    let _ = call.responder.send(outcome);
}

fn reject_stale(pending: &PendingMap, grace: Duration, err: &McpError) {
    let mut map = lock(pending);
    let stale: Vec<RequestId> = map
        .iter()
        .filter(|(_, call)| call.created_at.elapsed() >= grace)
        .map(|(id, _)| id.clone())
        .collect();
    if stale.is_empty() {
        debug!("Transport error with no call past grace window: {}", err);
        return;
    }
    warn!(affected = stale.len(), "Transport error: {}", err);
    for id in stale {
        if let Some(call) = map.remove(&id) {
            let _ = call.responder.send(Err(McpError::Transport(err.to_string())));
        }
    }
}

fn reject_all(pending: &PendingMap, make_err: impl Fn() -> McpError) {
    let drained: Vec<PendingCall> = lock(pending).drain().map(|(_, call)| call).collect();
    for call in drained {
        let _ = call.responder.send(Err(make_err()));
    }
}
