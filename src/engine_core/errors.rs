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

//! Error taxonomy shared by transports, client, dispatcher and executor.
//!
//! Messages returned by [`McpError::user_message`] are what crosses the wire;
//! the `Display` form may carry internal detail and is meant for logs.

use std::time::Duration;
use thiserror::Error;

use crate::engine_core::constants::jsonrpc;

/// Main error type for the MCP stack
#[derive(Error, Debug)]
pub enum McpError {
    /// Malformed envelope or params. Local, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The client stopped waiting. Never serialized onto the wire.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Connection-level failure: spawn failed, socket error, retries exhausted
    #[error("Transport error: {0}")]
    Transport(String),

    /// A tool handler failed with a machine-readable code such as `E_ACCESS_DENIED`
    #[error("Tool execution error [{code}]: {message}")]
    ToolExecution { code: String, message: String },

    /// Secure Process Executor concurrency limit reached
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// A sandboxed process wrote more than the configured byte cap
    #[error("Process output exceeded {limit} bytes")]
    OutputExceeded { limit: usize },

    /// JSON-RPC error response received from the remote side
    #[error("Remote error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The client was closed while the call was pending
    #[error("Client closed")]
    Closed,

    /// Invalid configuration (fail-closed at load or construction time)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O Error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type McpResult<T> = Result<T, McpError>;

impl McpError {
    /// Convenience constructor for handler failures.
    pub fn tool(code: impl Into<String>, message: impl Into<String>) -> Self {
        McpError::ToolExecution {
            code: code.into(),
            message: message.into(),
        }
    }

    /// JSON-RPC code used when this error is turned into a response.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            McpError::Validation(_) => jsonrpc::ERROR_INVALID_PARAMS,
            McpError::Capacity(_) => jsonrpc::ERROR_CAPACITY,
            McpError::Remote { code, .. } => *code,
            _ => jsonrpc::ERROR_INTERNAL,
        }
    }

    /// True for failures a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, McpError::Transport(_) | McpError::Capacity(_))
    }

    /// Get user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            McpError::Validation(reason) => format!("Validation failed: {}", reason),
            McpError::Timeout(_) => "Request timed out".to_string(),
            McpError::Transport(_) => "Service unavailable".to_string(),
            McpError::ToolExecution { message, .. } => message.clone(),
            McpError::Capacity(_) => "Too many concurrent processes".to_string(),
            McpError::OutputExceeded { .. } => "Process output exceeded limit".to_string(),
            McpError::Remote { message, .. } => message.clone(),
            McpError::Closed => "Client closed".to_string(),
            McpError::Configuration(_) => "Internal error".to_string(),
            McpError::Io(_) => "Internal system error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_not_transport() {
        let err = McpError::Timeout(Duration::from_millis(40));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Request timed out after 40ms");
    }

    #[test]
    fn test_user_message_hides_internals() {
        let err = McpError::Transport("connect to 10.0.0.7:8443 refused".to_string());
        assert_eq!(err.user_message(), "Service unavailable");

        let err = McpError::Configuration("LILITH_MCP_MAX_PROCESSES=0".to_string());
        assert!(!err.user_message().contains("LILITH"));
    }

    #[test]
    fn test_jsonrpc_codes() {
        assert_eq!(McpError::Validation("x".into()).jsonrpc_code(), -32602);
        assert_eq!(McpError::tool("E_ACCESS_DENIED", "no").jsonrpc_code(), -32603);
        let remote = McpError::Remote {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        assert_eq!(remote.jsonrpc_code(), -32601);
    }
}
