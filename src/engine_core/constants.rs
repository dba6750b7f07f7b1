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

//! lilith-mcp Constants - Single source of truth for protocol and configuration values.
//!
//! This module centralizes error codes, method names, limits and environment
//! variable names so the transports, client and dispatcher agree on them.

/// JSON-RPC 2.0 Error Codes
pub mod jsonrpc {
    /// Protocol version tag carried by every envelope
    pub const VERSION: &str = "2.0";
    /// Parse error (standard JSON-RPC)
    pub const ERROR_PARSE: i32 = -32700;
    /// Invalid request (standard JSON-RPC)
    pub const ERROR_INVALID_REQUEST: i32 = -32600;
    /// Method, tool, prompt or resource not found (standard JSON-RPC)
    pub const ERROR_METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params (standard JSON-RPC)
    pub const ERROR_INVALID_PARAMS: i32 = -32602;
    /// Internal error (standard JSON-RPC)
    pub const ERROR_INTERNAL: i32 = -32603;
    /// Executor capacity exhausted (server-defined range)
    pub const ERROR_CAPACITY: i32 = -32000;
}

/// MCP Protocol Methods
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const NOTIFICATIONS_INITIALIZED: &str = "notifications/initialized";
}

/// Server -> client notification methods
pub mod notifications {
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    /// Prefix shared by all notification-style methods
    pub const PREFIX: &str = "notifications/";
}

/// Protocol versions understood by the negotiation step
pub mod protocol {
    pub const V2024_11_05: &str = "2024-11-05";
    pub const V2025_03_26: &str = "2025-03-26";
    pub const V2025_06_18: &str = "2025-06-18";
    pub const LATEST: &str = V2025_06_18;
    pub const SUPPORTED: &[&str] = &[V2024_11_05, V2025_03_26, V2025_06_18];
}

/// Redaction of sensitive payload fields
pub mod redaction {
    /// Replacement written in place of a sensitive value
    pub const PLACEHOLDER: &str = "[REDACTED]";
    /// Keys (compared lower-cased) whose values never leave the process
    pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
        "password",
        "secret",
        "token",
        "apikey",
        "api_key",
        "authorization",
        "accesstoken",
        "access_token",
        "refreshtoken",
        "refresh_token",
        "privatekey",
        "private_key",
        "client_secret",
    ];
}

/// Transport defaults
pub mod transport {
    /// Default number of HTTP retries on network failure or 5xx
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Base delay for linear HTTP backoff (`attempt * base`)
    pub const DEFAULT_RETRY_DELAY_MS: u64 = 200;
    /// Default per-request HTTP timeout
    pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
    /// Capacity of each transport's event channel
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
    /// Environment variables a stdio child inherits from the parent
    pub const INHERITED_ENV: &[&str] = &["PATH", "HOME"];
    pub const SSE_MIME_TYPE: &str = "text/event-stream";
}

/// Enhanced client defaults
pub mod client {
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_MAX_RETRIES: u32 = 0;
    /// Age after which an uncorrelated transport error fails a pending call
    pub const DEFAULT_ERROR_GRACE_MS: u64 = 1_000;
}

/// Secure Process Executor defaults
pub mod executor {
    pub const DEFAULT_ALLOWED_COMMANDS: &[&str] =
        &["ls", "cat", "echo", "grep", "head", "tail", "wc", "git"];
    pub const DEFAULT_MAX_CONCURRENT: usize = 4;
    pub const MAX_CONCURRENT_UPPER_BOUND: usize = 64;
    pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
    pub const MIN_OUTPUT_BYTES: usize = 1024;
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
    /// Environment variables a sandboxed command inherits
    pub const INHERITED_ENV: &[&str] = &["PATH", "HOME", "LANG"];
}

/// Notification bridge defaults
pub mod watcher {
    pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
    pub const MIN_DEBOUNCE_MS: u64 = 50;
    pub const MAX_DEBOUNCE_MS: u64 = 5_000;
    /// Path components that never produce notifications
    pub const IGNORED_COMPONENTS: &[&str] =
        &[".git", ".hg", ".svn", "node_modules", "target", "dist", "build", ".cache"];
    pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 128;
}

/// Configuration Environment Variables
pub mod config {
    pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
    pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";
    pub const ENV_SERVER_NAME: &str = "LILITH_MCP_SERVER_NAME";
    pub const ENV_PROTOCOL_VERSION: &str = "LILITH_MCP_PROTOCOL_VERSION";
    pub const ENV_NOTIFY_PROMPTS: &str = "LILITH_MCP_NOTIFY_PROMPTS";
    pub const ENV_NOTIFY_RESOURCES: &str = "LILITH_MCP_NOTIFY_RESOURCES";
    pub const ENV_NOTIFY_TOOLS: &str = "LILITH_MCP_NOTIFY_TOOLS";
    pub const ENV_RESOURCE_SUBSCRIBE: &str = "LILITH_MCP_RESOURCE_SUBSCRIBE";
    pub const ENV_TOOL_VERSIONING: &str = "LILITH_MCP_TOOL_VERSIONING";
    pub const ENV_SPECULATIVE_SUBSCRIBE: &str = "LILITH_MCP_SPECULATIVE_SUBSCRIBE";
    pub const ENV_WATCH_DEBOUNCE_MS: &str = "LILITH_MCP_WATCH_DEBOUNCE_MS";
    pub const ENV_PROMPTS_DIR: &str = "LILITH_MCP_PROMPTS_DIR";
    pub const ENV_RESOURCES_DIR: &str = "LILITH_MCP_RESOURCES_DIR";
    pub const ENV_TOOLS_DIR: &str = "LILITH_MCP_TOOLS_DIR";
    pub const ENV_ALLOWED_COMMANDS: &str = "LILITH_MCP_ALLOWED_COMMANDS";
    pub const ENV_MAX_PROCESSES: &str = "LILITH_MCP_MAX_PROCESSES";
    pub const ENV_MAX_OUTPUT_BYTES: &str = "LILITH_MCP_MAX_OUTPUT_BYTES";
    pub const ENV_SENSITIVE_KEYS: &str = "LILITH_MCP_SENSITIVE_KEYS";
}

/// Transport Limits (DoS Protection)
pub mod limits {
    /// Maximum allowed JSON-RPC message size (10 MB)
    pub const MAX_MESSAGE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
}
