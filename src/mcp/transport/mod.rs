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

//! Transport abstraction.
//!
//! A transport moves JSON-RPC envelopes to and from one provider and reports
//! what it receives as [`TransportEvent`]s on a bounded channel. The client
//! layer correlates those events with pending requests; transports never do.

pub mod http;
pub mod sse;
pub mod stdio;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::engine_core::errors::{McpError, McpResult};
use crate::mcp::codec::MessageCodec;

pub use http::HttpTransport;
pub use sse::{SseParser, SseTransport};
pub use stdio::StdioTransport;

/// Something a transport observed.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded inbound envelope.
    Message(Value),
    /// A non-fatal problem: malformed input, a failed request, a dropped stream.
    Error(McpError),
    /// The upstream process ended.
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lock-free holder for a [`TransportState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub(crate) fn get(&self) -> TransportState {
        match self.0.load(Ordering::Acquire) {
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            _ => TransportState::Disconnected,
        }
    }

    pub(crate) fn set(&self, state: TransportState) {
        self.0.store(Self::raw(state), Ordering::Release);
    }

    /// Moves `from -> to`; false if the current state was not `from`.
    pub(crate) fn transition(&self, from: TransportState, to: TransportState) -> bool {
        let (f, t) = (Self::raw(from), Self::raw(to));
        self.0
            .compare_exchange(f, t, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn raw(state: TransportState) -> u8 {
        match state {
            TransportState::Disconnected => 0,
            TransportState::Connecting => 1,
            TransportState::Connected => 2,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs: `stdio`, `http` or `sse`.
    fn kind(&self) -> &'static str;

    fn state(&self) -> TransportState;

    async fn connect(&self) -> McpResult<()>;

    /// Writes one envelope. Requests are validated and every envelope is
    /// redacted before it reaches the wire.
    async fn send(&self, message: &Value) -> McpResult<()>;

    async fn disconnect(&self) -> McpResult<()>;

    /// Hands out the event receiver. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// Validates and redacts `message` for the wire.
///
/// Objects carrying a `method` and no `id` are notifications and are checked
/// as such; everything else must pass full envelope validation.
pub(crate) fn prepare(codec: &MessageCodec, message: &Value) -> McpResult<Option<Value>> {
    let is_notification = message
        .as_object()
        .map(|obj| obj.contains_key("method") && !obj.contains_key("id"))
        .unwrap_or(false);
    if is_notification {
        codec.prepare_notification(message)
    } else {
        codec.prepare_outbound(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// How to reach a provider. Deserializes from `{"type": "stdio" | "http" |
/// "sse" | "streamableHttp", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransportConfig {
    Stdio(StdioConfig),
    #[serde(alias = "streamableHttp")]
    Http(HttpConfig),
    Sse(SseConfig),
}

impl TransportConfig {
    /// Parses and validates a JSON config.
    pub fn from_value(value: Value) -> McpResult<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| McpError::Configuration(format!("Invalid transport config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            Self::Stdio(c) => c.timeout_ms,
            Self::Http(c) => c.timeout_ms,
            Self::Sse(c) => c.timeout_ms,
        }
    }

    pub fn max_retries(&self) -> Option<u32> {
        match self {
            Self::Stdio(c) => c.max_retries,
            Self::Http(c) => c.max_retries,
            Self::Sse(c) => c.max_retries,
        }
    }

    /// Fails closed on anything a transport could not start from.
    pub fn validate(&self) -> McpResult<()> {
        if self.timeout_ms() == Some(0) {
            return Err(McpError::Configuration(
                "timeoutMs must be greater than zero".to_string(),
            ));
        }
        match self {
            Self::Stdio(c) => {
                if c.command.trim().is_empty() {
                    return Err(McpError::Configuration(
                        "stdio transport requires a non-empty command".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Http(c) => validate_url("url", &c.url).map(|_| ()),
            Self::Sse(c) => {
                validate_url("url", &c.url)?;
                if let Some(write_url) = &c.write_url {
                    validate_url("writeUrl", write_url)?;
                }
                Ok(())
            }
        }
    }
}

pub(crate) fn validate_url(field: &str, raw: &str) -> McpResult<reqwest::Url> {
    if raw.trim().is_empty() {
        return Err(McpError::Configuration(format!("{} must not be empty", field)));
    }
    let url = reqwest::Url::parse(raw)
        .map_err(|e| McpError::Configuration(format!("Invalid {} '{}': {}", field, raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(McpError::Configuration(format!(
            "Unsupported {} scheme '{}'; expected http or https",
            field, other
        ))),
    }
}

/// Builds the transport for `config`, validating it first. No I/O happens
/// until [`Transport::connect`].
pub fn create_transport(config: TransportConfig) -> McpResult<Arc<dyn Transport>> {
    config.validate()?;
    let transport: Arc<dyn Transport> = match config {
        TransportConfig::Stdio(c) => Arc::new(StdioTransport::new(c)),
        TransportConfig::Http(c) => Arc::new(HttpTransport::new(c)?),
        TransportConfig::Sse(c) => Arc::new(SseTransport::new(c)?),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_streamable_http_alias() {
        let config = TransportConfig::from_value(json!({
            "type": "streamableHttp",
            "url": "https://example.com/mcp",
            "timeoutMs": 500
        }))
        .unwrap();
        match config {
            TransportConfig::Http(c) => assert_eq!(c.timeout_ms, Some(500)),
            other => panic!("expected http, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_required_field_fails() {
        assert!(TransportConfig::from_value(json!({"type": "stdio"})).is_err());
        assert!(TransportConfig::from_value(json!({"type": "sse"})).is_err());
        assert!(TransportConfig::from_value(json!({"type": "carrier-pigeon"})).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            json!({"type": "stdio", "command": "  "}),
            json!({"type": "http", "url": ""}),
            json!({"type": "http", "url": "ftp://example.com"}),
            json!({"type": "http", "url": "not a url"}),
            json!({"type": "sse", "url": "https://x", "writeUrl": "file:///etc"}),
            json!({"type": "stdio", "command": "cat", "timeoutMs": 0}),
        ];
        for value in bad {
            let err = TransportConfig::from_value(value.clone()).unwrap_err();
            assert!(
                matches!(err, McpError::Configuration(_)),
                "{} gave {:?}",
                value,
                err
            );
        }
    }

    #[test]
    fn test_state_cell_transition() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), TransportState::Disconnected);
        assert!(cell.transition(TransportState::Disconnected, TransportState::Connecting));
        assert!(!cell.transition(TransportState::Disconnected, TransportState::Connected));
        cell.set(TransportState::Connected);
        assert_eq!(cell.get(), TransportState::Connected);
    }
}
