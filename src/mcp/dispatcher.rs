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

//! Server-side JSON-RPC dispatcher.
//!
//! Registries are populated at start-up (and optionally later); each request
//! is handled independently against them. Outbound notifications go to a
//! bounded channel that the serving loop drains.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{CapabilityConfig, Config};
use crate::engine_core::constants::{jsonrpc, methods, notifications, watcher};
use crate::engine_core::errors::{McpError, McpResult};
use crate::engine_core::models::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PromptDefinition, RequestId,
    ResourceDefinition, ToolCallResult, ToolDefinition,
};
use crate::mcp::bridge::NotificationSink;
use crate::mcp::codec::MessageCodec;
use crate::mcp::executor::SecureExecutor;
use crate::protocol::negotiation::ProtocolNegotiator;

/// Per-invocation context handed to tool handlers.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: Option<RequestId>,
    /// Unique per call, for correlating handler logs.
    pub invocation_id: Uuid,
    executor: Option<Arc<SecureExecutor>>,
}

impl ExecutionContext {
    pub fn new(request_id: Option<RequestId>, executor: Option<Arc<SecureExecutor>>) -> Self {
        Self {
            request_id,
            invocation_id: Uuid::new_v4(),
            executor,
        }
    }

    /// The shared process executor, for handlers that must spawn commands.
    pub fn executor(&self) -> McpResult<&SecureExecutor> {
        self.executor
            .as_deref()
            .ok_or_else(|| McpError::tool("E_UNAVAILABLE", "Process execution is not enabled"))
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value, ctx: ExecutionContext) -> McpResult<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = McpResult<Value>> + Send + 'static,
{
    async fn call(&self, arguments: Value, ctx: ExecutionContext) -> McpResult<Value> {
        (self.0)(arguments, ctx).await
    }
}

/// Wraps an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = McpResult<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub request_count: u64,
    pub active_requests: usize,
    pub tools: usize,
    pub prompts: usize,
    pub resources: usize,
    pub subscriptions: usize,
    pub started_at: DateTime<Utc>,
}

/// Keeps `active_requests` accurate even if the handler future is dropped.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Dispatcher {
    server_name: String,
    server_version: String,
    preferred_protocol: String,
    capabilities: CapabilityConfig,
    allow_speculative_subscriptions: bool,
    codec: MessageCodec,
    executor: Option<Arc<SecureExecutor>>,
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
    prompts: RwLock<BTreeMap<String, PromptDefinition>>,
    resources: RwLock<BTreeMap<String, ResourceDefinition>>,
    subscriptions: RwLock<BTreeSet<String>>,
    request_count: AtomicU64,
    active_requests: AtomicUsize,
    started_at: DateTime<Utc>,
    notifications_tx: mpsc::Sender<JsonRpcNotification>,
    notifications_rx: Mutex<Option<mpsc::Receiver<JsonRpcNotification>>>,
}

impl Dispatcher {
    pub fn new(config: &Config) -> Self {
        let (notifications_tx, notifications_rx) =
            mpsc::channel(watcher::NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            server_name: config.server_name.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            preferred_protocol: config.protocol_version.clone(),
            capabilities: config.capabilities.clone(),
            allow_speculative_subscriptions: config.allow_speculative_subscriptions,
            codec: MessageCodec::new(config.sensitive_keys.iter()),
            executor: None,
            tools: RwLock::new(BTreeMap::new()),
            prompts: RwLock::new(BTreeMap::new()),
            resources: RwLock::new(BTreeMap::new()),
            subscriptions: RwLock::new(BTreeSet::new()),
            request_count: AtomicU64::new(0),
            active_requests: AtomicUsize::new(0),
            started_at: Utc::now(),
            notifications_tx,
            notifications_rx: Mutex::new(Some(notifications_rx)),
        }
    }

    pub fn with_executor(mut self, executor: Arc<SecureExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn register_tool(&self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        debug!(tool = %definition.name, "Registering tool");
        write(&self.tools).insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                handler,
            },
        );
    }

    pub fn register_prompt(&self, definition: PromptDefinition) {
        debug!(prompt = %definition.name, "Registering prompt");
        write(&self.prompts).insert(definition.name.clone(), definition);
    }

    pub fn register_resource(&self, definition: ResourceDefinition) {
        debug!(uri = %definition.uri, "Registering resource");
        write(&self.resources).insert(definition.uri.clone(), definition);
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        read(&self.subscriptions).contains(uri)
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            request_count: self.request_count.load(Ordering::SeqCst),
            active_requests: self.active_requests.load(Ordering::SeqCst),
            tools: read(&self.tools).len(),
            prompts: read(&self.prompts).len(),
            resources: read(&self.resources).len(),
            subscriptions: read(&self.subscriptions).len(),
            started_at: self.started_at,
        }
    }

    /// Outbound notifications. Only the first caller gets the receiver.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<JsonRpcNotification>> {
        self.notifications_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Entry point for raw decoded JSON.
    ///
    /// Returns `None` when no response must be written: for id-less
    /// `notifications/*` messages.
    pub async fn handle_value(&self, value: Value) -> Option<JsonRpcResponse> {
        let raw_id = value.get("id").and_then(RequestId::from_value);
        let well_formed = value.get("jsonrpc").and_then(Value::as_str) == Some(jsonrpc::VERSION)
            && value.get("method").map(Value::is_string).unwrap_or(false);
        if !well_formed {
            warn!("Rejecting invalid JSON-RPC request");
            return Some(JsonRpcResponse::failure(
                raw_id,
                jsonrpc::ERROR_INVALID_REQUEST,
                "Invalid Request",
            ));
        }
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting malformed request: {}", e);
                return Some(JsonRpcResponse::failure(
                    raw_id,
                    jsonrpc::ERROR_INVALID_REQUEST,
                    "Invalid Request",
                ));
            }
        };

        if request.id.is_none() && request.method.starts_with(notifications::PREFIX) {
            debug!(method = %request.method, "Client notification");
            self.request_count.fetch_add(1, Ordering::SeqCst);
            return None;
        }
        Some(self.handle(request).await)
    }

    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        let id = request.id.clone();
        debug!(method = %request.method, id = ?id, "Dispatching request");

        let outcome = match request.method.as_str() {
            methods::INITIALIZE => Ok(self.initialize(&request)),
            methods::PING => Ok(json!({})),
            methods::NOTIFICATIONS_INITIALIZED => Ok(json!({})),
            methods::TOOLS_LIST => Ok(self.list_tools()),
            methods::TOOLS_CALL => self.call_tool(&request).await,
            methods::PROMPTS_LIST => Ok(self.list_prompts()),
            methods::PROMPTS_GET => self.get_prompt(&request),
            methods::RESOURCES_LIST => Ok(self.list_resources()),
            methods::RESOURCES_READ => self.read_resource(&request).await,
            methods::RESOURCES_SUBSCRIBE => self.subscribe(&request),
            methods::RESOURCES_UNSUBSCRIBE => self.unsubscribe(&request),
            other => {
                debug!(method = other, "Unknown method");
                Err(rpc_error(jsonrpc::ERROR_METHOD_NOT_FOUND, "Method not found"))
            }
        };

        match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(err) => JsonRpcResponse::failure_with_data(
                id,
                err.code,
                err.message,
                err.data.map(|d| self.codec.redact(&d)),
            ),
        }
    }

    fn initialize(&self, request: &JsonRpcRequest) -> Value {
        let requested = request.param_str("protocolVersion");
        let version = ProtocolNegotiator::negotiate(requested, &self.preferred_protocol);
        info!(client = ?request.params.as_ref().and_then(|p| p.get("clientInfo")), version, "Client initializing");

        let caps = &self.capabilities;
        let mut capabilities = json!({
            "tools": { "listChanged": caps.notify_tools },
            "prompts": { "listChanged": caps.notify_prompts },
            "resources": {
                "subscribe": caps.resource_subscribe,
                "listChanged": caps.notify_resources,
            },
        });
        if caps.tool_versioning {
            capabilities["experimental"] = json!({ "toolVersioning": true });
        }
        json!({
            "protocolVersion": version,
            "serverInfo": { "name": self.server_name, "version": self.server_version },
            "capabilities": capabilities,
        })
    }

    fn list_tools(&self) -> Value {
        let tools: Vec<ToolDefinition> = read(&self.tools)
            .values()
            .map(|t| {
                let mut def = t.definition.clone();
                if !self.capabilities.tool_versioning {
                    def.version = None;
                }
                def
            })
            .collect();
        json!({ "tools": tools })
    }

    fn list_prompts(&self) -> Value {
        let prompts: Vec<PromptDefinition> = read(&self.prompts).values().cloned().collect();
        json!({ "prompts": prompts })
    }

    fn list_resources(&self) -> Value {
        let resources: Vec<ResourceDefinition> = read(&self.resources).values().cloned().collect();
        json!({ "resources": resources })
    }

    async fn call_tool(&self, request: &JsonRpcRequest) -> Result<Value, RpcError> {
        let name = request
            .param_str("name")
            .ok_or_else(|| rpc_error(jsonrpc::ERROR_INVALID_PARAMS, "Missing tool name"))?;
        let handler = read(&self.tools)
            .get(name)
            .map(|t| t.handler.clone())
            .ok_or_else(|| {
                rpc_error(jsonrpc::ERROR_METHOD_NOT_FOUND, format!("Tool not found: {}", name))
            })?;
        let arguments = request
            .params
            .as_ref()
            .and_then(|p| p.get("arguments"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        let ctx = ExecutionContext::new(request.id.clone(), self.executor.clone());
        let invocation = ctx.invocation_id;

        let _active = ActiveGuard::enter(&self.active_requests);
        // A separate task turns a handler panic into a JoinError.
        let joined = tokio::spawn(async move { handler.call(arguments, ctx).await }).await;

        match joined {
            Ok(Ok(value)) => serde_json::to_value(ToolCallResult::from_value(&value))
                .map_err(|e| rpc_error(jsonrpc::ERROR_INTERNAL, format!("Internal error: {}", e))),
            Ok(Err(err)) => {
                warn!(tool = name, %invocation, "Tool failed: {}", err);
                Err(RpcError {
                    code: jsonrpc::ERROR_INTERNAL,
                    message: err.user_message(),
                    data: Some(json!({ "code": error_code(&err) })),
                })
            }
            Err(join_err) => {
                error!(tool = name, %invocation, "Tool handler aborted: {}", join_err);
                Err(RpcError {
                    code: jsonrpc::ERROR_INTERNAL,
                    message: "Internal error".to_string(),
                    data: Some(json!({ "code": "E_INTERNAL" })),
                })
            }
        }
    }

    fn get_prompt(&self, request: &JsonRpcRequest) -> Result<Value, RpcError> {
        let name = request
            .param_str("name")
            .ok_or_else(|| rpc_error(jsonrpc::ERROR_INVALID_PARAMS, "Missing prompt name"))?;
        let prompt = read(&self.prompts).get(name).cloned().ok_or_else(|| {
            rpc_error(jsonrpc::ERROR_METHOD_NOT_FOUND, format!("Prompt not found: {}", name))
        })?;
        let arguments = request
            .params
            .as_ref()
            .and_then(|p| p.get("arguments"))
            .and_then(Value::as_object);

        for arg in prompt.arguments.iter().flatten().filter(|a| a.required) {
            if arguments.and_then(|a| a.get(&arg.name)).is_none() {
                return Err(rpc_error(
                    jsonrpc::ERROR_INVALID_PARAMS,
                    format!("Missing required argument: {}", arg.name),
                ));
            }
        }

        let mut text = prompt
            .template
            .clone()
            .unwrap_or_else(|| prompt.description.clone());
        for (key, value) in arguments.into_iter().flatten() {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text = text.replace(&format!("{{{{{}}}}}", key), &rendered);
        }

        Ok(json!({
            "description": prompt.description,
            "messages": [{ "role": "user", "content": { "type": "text", "text": text } }],
        }))
    }

    async fn read_resource(&self, request: &JsonRpcRequest) -> Result<Value, RpcError> {
        let uri = request
            .param_str("uri")
            .ok_or_else(|| rpc_error(jsonrpc::ERROR_INVALID_PARAMS, "Missing resource uri"))?;
        let resource = read(&self.resources).get(uri).cloned().ok_or_else(|| {
            rpc_error(jsonrpc::ERROR_METHOD_NOT_FOUND, format!("Resource not found: {}", uri))
        })?;

        let text = match (&resource.text, uri.strip_prefix("file://")) {
            (Some(text), _) => text.clone(),
            (None, Some(path)) => tokio::fs::read_to_string(path).await.map_err(|e| {
                warn!(uri, "Failed to read resource: {}", e);
                let code = match e.kind() {
                    std::io::ErrorKind::NotFound => "E_FILE_NOT_FOUND",
                    std::io::ErrorKind::PermissionDenied => "E_ACCESS_DENIED",
                    _ => "E_IO",
                };
                RpcError {
                    code: jsonrpc::ERROR_INTERNAL,
                    message: "Failed to read resource".to_string(),
                    data: Some(json!({ "code": code })),
                }
            })?,
            (None, None) => {
                return Err(rpc_error(jsonrpc::ERROR_INTERNAL, "Resource has no readable content"))
            }
        };

        let mut content = json!({ "uri": resource.uri, "text": text });
        if let Some(mime) = &resource.mime_type {
            content["mimeType"] = json!(mime);
        }
        Ok(json!({ "contents": [content] }))
    }

    fn subscribe(&self, request: &JsonRpcRequest) -> Result<Value, RpcError> {
        if !self.capabilities.resource_subscribe {
            return Err(rpc_error(jsonrpc::ERROR_METHOD_NOT_FOUND, "Method not found"));
        }
        let uri = request
            .param_str("uri")
            .ok_or_else(|| rpc_error(jsonrpc::ERROR_INVALID_PARAMS, "Missing resource uri"))?;
        let known = read(&self.resources).contains_key(uri);
        if !known && !self.allow_speculative_subscriptions {
            return Err(rpc_error(
                jsonrpc::ERROR_INVALID_PARAMS,
                format!("Unknown resource: {}", uri),
            ));
        }
        write(&self.subscriptions).insert(uri.to_string());
        debug!(uri, speculative = !known, "Subscribed");
        Ok(json!({}))
    }

    fn unsubscribe(&self, request: &JsonRpcRequest) -> Result<Value, RpcError> {
        if !self.capabilities.resource_subscribe {
            return Err(rpc_error(jsonrpc::ERROR_METHOD_NOT_FOUND, "Method not found"));
        }
        let uri = request
            .param_str("uri")
            .ok_or_else(|| rpc_error(jsonrpc::ERROR_INVALID_PARAMS, "Missing resource uri"))?;
        write(&self.subscriptions).remove(uri);
        Ok(json!({}))
    }

    fn push(&self, notification: JsonRpcNotification) -> bool {
        match self.notifications_tx.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(n)) => {
                warn!(method = %n.method, "Notification channel full, dropping");
                false
            }
            Err(TrySendError::Closed(n)) => {
                debug!(method = %n.method, "No notification consumer");
                false
            }
        }
    }

    pub fn emit_prompts_list_changed(&self) -> bool {
        self.capabilities.notify_prompts
            && self.push(JsonRpcNotification::new(notifications::PROMPTS_LIST_CHANGED, None))
    }

    pub fn emit_resources_list_changed(&self) -> bool {
        self.capabilities.notify_resources
            && self.push(JsonRpcNotification::new(notifications::RESOURCES_LIST_CHANGED, None))
    }

    pub fn emit_tools_list_changed(&self) -> bool {
        self.capabilities.notify_tools
            && self.push(JsonRpcNotification::new(notifications::TOOLS_LIST_CHANGED, None))
    }

    /// Only subscribed URIs produce an update.
    pub fn emit_resource_updated(&self, uri: &str) -> bool {
        if !self.capabilities.resource_subscribe || !self.is_subscribed(uri) {
            return false;
        }
        self.push(JsonRpcNotification::new(
            notifications::RESOURCES_UPDATED,
            Some(json!({ "uri": uri })),
        ))
    }
}

impl NotificationSink for Dispatcher {
    fn prompts_list_changed(&self) {
        self.emit_prompts_list_changed();
    }

    fn resources_list_changed(&self) {
        self.emit_resources_list_changed();
    }

    fn resource_updated(&self, uri: &str) {
        self.emit_resource_updated(uri);
    }

    fn tools_list_changed(&self) {
        self.emit_tools_list_changed();
    }
}

struct RpcError {
    code: i32,
    message: String,
    data: Option<Value>,
}

fn rpc_error(code: i32, message: impl Into<String>) -> RpcError {
    RpcError {
        code,
        message: message.into(),
        data: None,
    }
}

/// Machine-readable code reported in `error.data.code`.
fn error_code(err: &McpError) -> String {
    match err {
        McpError::ToolExecution { code, .. } => code.clone(),
        McpError::Validation(_) => "E_INVALID_ARGUMENT".to_string(),
        McpError::Timeout(_) => "E_TIMEOUT".to_string(),
        McpError::Capacity(_) => "E_CAPACITY".to_string(),
        McpError::OutputExceeded { .. } => "E_OUTPUT_EXCEEDED".to_string(),
        _ => "E_INTERNAL".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_core::models::PromptArgument;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(&Config::default())
    }

    fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(id, method, Some(params))
    }

    #[tokio::test]
    async fn test_initialize_reports_capabilities() {
        let d = dispatcher();
        let resp = d
            .handle(request(1, "initialize", json!({"protocolVersion": "2024-11-05"})))
            .await;
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "lilith-mcp");
        assert_eq!(result["capabilities"]["resources"]["subscribe"], true);
    }

    #[tokio::test]
    async fn test_tool_versions_hidden_unless_enabled() {
        let d = dispatcher();
        let mut def = ToolDefinition::new("echo", "Echo", json!({"type": "object"}));
        def.version = Some("1.2.0".into());
        d.register_tool(def, handler_fn(|args, _| async move { Ok::<_, McpError>(args) }));
        let resp = d.handle(request(1, "tools/list", json!({}))).await;
        assert!(resp.result.unwrap()["tools"][0].get("version").is_none());

        let mut config = Config::default();
        config.capabilities.tool_versioning = true;
        let d = Dispatcher::new(&config);
        let mut def = ToolDefinition::new("echo", "Echo", json!({"type": "object"}));
        def.version = Some("1.2.0".into());
        d.register_tool(def, handler_fn(|args, _| async move { Ok::<_, McpError>(args) }));
        let resp = d.handle(request(1, "tools/list", json!({}))).await;
        assert_eq!(resp.result.unwrap()["tools"][0]["version"], "1.2.0");
    }

    #[tokio::test]
    async fn test_handler_panic_is_internal_error() {
        let d = dispatcher();
        d.register_tool(
            ToolDefinition::new("boom", "Panics", json!({})),
            handler_fn(|_, _| async move {
                if true {
                    panic!("handler bug");
                }
                Ok::<_, McpError>(Value::Null)
            }),
        );
        let resp = d
            .handle(request(1, "tools/call", json!({"name": "boom"})))
            .await;
        assert_eq!(resp.error.unwrap().code, -32603);
        assert_eq!(d.stats().active_requests, 0);
    }

    #[tokio::test]
    async fn test_handler_error_carries_code_and_is_redacted() {
        let d = dispatcher();
        d.register_tool(
            ToolDefinition::new("deny", "Denies", json!({})),
            handler_fn(|_, _| async move {
                Err::<Value, _>(McpError::tool("E_ACCESS_DENIED", "Access denied"))
            }),
        );
        let resp = d
            .handle(request(1, "tools/call", json!({"name": "deny"})))
            .await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32603);
        assert_eq!(err.message, "Access denied");
        assert_eq!(err.data.unwrap()["code"], "E_ACCESS_DENIED");
    }

    #[tokio::test]
    async fn test_prompt_rendering() {
        let d = dispatcher();
        d.register_prompt(PromptDefinition {
            name: "greet".into(),
            description: "Greets".into(),
            arguments: Some(vec![PromptArgument {
                name: "who".into(),
                description: None,
                required: true,
            }]),
            template: Some("Hello, {{who}}!".into()),
        });
        let resp = d
            .handle(request(1, "prompts/get", json!({"name": "greet", "arguments": {"who": "Ada"}})))
            .await;
        assert_eq!(
            resp.result.unwrap()["messages"][0]["content"]["text"],
            "Hello, Ada!"
        );

        let resp = d.handle(request(2, "prompts/get", json!({"name": "greet"}))).await;
        assert_eq!(resp.error.unwrap().code, -32602);
        let resp = d.handle(request(3, "prompts/get", json!({"name": "nope"}))).await;
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_read_inline_and_file_resources() {
        let d = dispatcher();
        let mut inline = ResourceDefinition::new("mem://motd", "motd");
        inline.text = Some("hi".into());
        d.register_resource(inline);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# notes").unwrap();
        let uri = format!("file://{}", path.display());
        d.register_resource(ResourceDefinition::new(uri.clone(), "notes"));

        let resp = d.handle(request(1, "resources/read", json!({"uri": "mem://motd"}))).await;
        assert_eq!(resp.result.unwrap()["contents"][0]["text"], "hi");
        let resp = d.handle(request(2, "resources/read", json!({"uri": uri}))).await;
        assert_eq!(resp.result.unwrap()["contents"][0]["text"], "# notes");
        let resp = d.handle(request(3, "resources/read", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, -32602);
        let resp = d.handle(request(4, "resources/read", json!({"uri": "mem://none"}))).await;
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_subscription_policy() {
        let d = dispatcher();
        let resp = d
            .handle(request(1, "resources/subscribe", json!({"uri": "file:///later.md"})))
            .await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32602);
        assert!(err.message.contains("Unknown resource"));

        let mut config = Config::default();
        config.allow_speculative_subscriptions = true;
        let d = Dispatcher::new(&config);
        let resp = d
            .handle(request(1, "resources/subscribe", json!({"uri": "file:///later.md"})))
            .await;
        assert!(resp.error.is_none());
        assert!(d.is_subscribed("file:///later.md"));

        d.handle(request(2, "resources/unsubscribe", json!({"uri": "file:///later.md"})))
            .await;
        assert!(!d.is_subscribed("file:///later.md"));
    }

    #[tokio::test]
    async fn test_updates_only_for_subscribed_uris() {
        let mut config = Config::default();
        config.allow_speculative_subscriptions = true;
        let d = Dispatcher::new(&config);
        let mut rx = d.take_notifications().unwrap();

        assert!(!d.emit_resource_updated("file:///a"));
        d.handle(request(1, "resources/subscribe", json!({"uri": "file:///a"})))
            .await;
        assert!(d.emit_resource_updated("file:///a"));
        let n = rx.recv().await.unwrap();
        assert_eq!(n.method, "notifications/resources/updated");
        assert_eq!(n.params.unwrap()["uri"], "file:///a");
    }

    #[tokio::test]
    async fn test_capability_toggle_suppresses_notification() {
        let mut config = Config::default();
        config.capabilities.notify_tools = false;
        let d = Dispatcher::new(&config);
        let _rx = d.take_notifications().unwrap();
        assert!(!d.emit_tools_list_changed());
        assert!(d.emit_prompts_list_changed());
    }

    #[tokio::test]
    async fn test_handle_value_edges() {
        let d = dispatcher();
        let resp = d.handle_value(json!({"jsonrpc": "1.0", "id": 3, "method": "ping"})).await;
        let resp = resp.unwrap();
        assert_eq!(resp.error.unwrap().code, -32600);
        assert_eq!(resp.id, Some(RequestId::Number(3)));

        assert!(d
            .handle_value(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .is_none());

        let resp = d
            .handle_value(json!({"jsonrpc": "2.0", "method": "ping"}))
            .await
            .unwrap();
        let wire = serde_json::to_value(&resp).unwrap();
        assert!(wire.get("id").is_none());
        assert_eq!(wire["result"], json!({}));
    }
}
