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

//! MCP Message Codec.
//!
//! Two layers live here:
//! - [`McpCodec`]: byte-level framing of newline-delimited JSON-RPC messages
//!   for `tokio_util::codec::FramedRead`/`FramedWrite`.
//! - [`MessageCodec`]: envelope validation and redaction of sensitive fields
//!   applied to every outbound message.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::engine_core::constants::{jsonrpc, limits, redaction};
use crate::engine_core::errors::McpError;

/// One decoded line of the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Value),
    /// The line was not valid JSON. The connection stays usable.
    Malformed { line: String, error: String },
}

/// Newline-delimited JSON framing.
///
/// Partial lines stay in the buffer until their `\n` arrives, so a message
/// split across reads (`{"jsonrpc":"2` + `.0",...}\n`) decodes as one frame.
#[derive(Debug, Default)]
pub struct McpCodec {
    // Bytes already scanned for '\n', so we do not rescan on every read.
    scanned: usize,
}

impl McpCodec {
    #[must_use]
    pub fn new() -> Self {
        Self { scanned: 0 }
    }
}

impl Decoder for McpCodec {
    type Item = Frame;
    type Error = McpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, McpError> {
        loop {
            trace!("Decoder attempting to read from {} bytes buffer", src.len());
            let newline = src[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                self.scanned = src.len();
                if src.len() as u64 > limits::MAX_MESSAGE_SIZE_BYTES {
                    return Err(McpError::Transport(format!(
                        "Message exceeded size limit of {} bytes",
                        limits::MAX_MESSAGE_SIZE_BYTES
                    )));
                }
                return Ok(None);
            };

            let line_end = self.scanned + offset;
            self.scanned = 0;
            let line = src.split_to(line_end + 1);
            let mut body = &line[..line_end];
            if body.last() == Some(&b'\r') {
                body = &body[..body.len() - 1];
            }
            if body.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(Some(match serde_json::from_slice::<Value>(body) {
                Ok(value) => Frame::Message(value),
                Err(e) => Frame::Malformed {
                    line: String::from_utf8_lossy(body).into_owned(),
                    error: e.to_string(),
                },
            }));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, McpError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            return Ok(None);
        }
        // Unterminated trailing data at EOF is reported but not parsed.
        let rest = src.split_to(src.len());
        self.scanned = 0;
        Ok(Some(Frame::Malformed {
            line: String::from_utf8_lossy(&rest).into_owned(),
            error: "unterminated message at end of stream".to_string(),
        }))
    }
}

impl<'a, T: Serialize> Encoder<&'a T> for McpCodec {
    type Error = McpError;

    fn encode(&mut self, item: &'a T, dst: &mut BytesMut) -> Result<(), McpError> {
        let body = serde_json::to_vec(item)
            .map_err(|e| McpError::Validation(format!("Failed to serialize message: {}", e)))?;
        dst.reserve(body.len() + 1);
        dst.extend_from_slice(&body);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Hook receiving validation failures instead of having them raised.
pub type ErrorHook = Arc<dyn Fn(&McpError) + Send + Sync>;

/// Envelope validation and redaction.
#[derive(Clone)]
pub struct MessageCodec {
    sensitive_keys: HashSet<String>,
    on_error: Option<ErrorHook>,
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("sensitive_keys", &self.sensitive_keys)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(redaction::DEFAULT_SENSITIVE_KEYS.iter().copied())
    }
}

impl MessageCodec {
    pub fn new<I, S>(sensitive_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sensitive_keys: sensitive_keys
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .collect(),
            on_error: None,
        }
    }

    /// Routes validation failures to `hook` instead of returning them.
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.on_error = Some(hook);
        self
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        self.sensitive_keys.contains(&key.to_lowercase())
    }

    /// Checks `jsonrpc == "2.0"` and a string or numeric `id`.
    ///
    /// Returns `Ok(true)` for a valid envelope. For an invalid one, returns
    /// `Ok(false)` after calling the error hook if configured, or the
    /// [`McpError::Validation`] otherwise.
    pub fn validate(&self, envelope: &Value) -> Result<bool, McpError> {
        match Self::check(envelope) {
            Ok(()) => Ok(true),
            Err(err) => match &self.on_error {
                Some(hook) => {
                    warn!("Dropping invalid envelope: {}", err);
                    hook(&err);
                    Ok(false)
                }
                None => Err(err),
            },
        }
    }

    fn check(envelope: &Value) -> Result<(), McpError> {
        let obj = envelope
            .as_object()
            .ok_or_else(|| McpError::Validation("envelope must be a JSON object".to_string()))?;

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(v) if v == jsonrpc::VERSION => {}
            Some(v) => {
                return Err(McpError::Validation(format!(
                    "unsupported jsonrpc version '{}'",
                    v
                )))
            }
            None => return Err(McpError::Validation("missing 'jsonrpc' field".to_string())),
        }

        match obj.get("id") {
            Some(Value::String(_)) | Some(Value::Number(_)) => Ok(()),
            Some(other) => Err(McpError::Validation(format!(
                "'id' must be a string or number, got {}",
                type_name(other)
            ))),
            None => Err(McpError::Validation("missing 'id' field".to_string())),
        }
    }

    /// Returns a copy of `value` with every sensitive key's value replaced.
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let v = if self.is_sensitive(k) {
                            Value::String(redaction::PLACEHOLDER.to_string())
                        } else {
                            self.redact(v)
                        };
                        (k.clone(), v)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }

    /// Serializes, validates and redacts an outbound envelope.
    ///
    /// `Ok(None)` means the envelope was invalid and swallowed by the hook.
    pub fn prepare_outbound<T: Serialize>(&self, message: &T) -> Result<Option<Value>, McpError> {
        let value = serde_json::to_value(message)
            .map_err(|e| McpError::Validation(format!("Failed to serialize message: {}", e)))?;
        if !self.validate(&value)? {
            return Ok(None);
        }
        Ok(Some(self.redact(&value)))
    }

    /// Like [`prepare_outbound`](Self::prepare_outbound) for id-less
    /// notifications: requires `jsonrpc == "2.0"`, a string `method` and no
    /// `id`.
    pub fn prepare_notification<T: Serialize>(
        &self,
        message: &T,
    ) -> Result<Option<Value>, McpError> {
        let value = serde_json::to_value(message)
            .map_err(|e| McpError::Validation(format!("Failed to serialize message: {}", e)))?;
        let checked = match value.as_object() {
            Some(obj)
                if obj.get("jsonrpc").and_then(Value::as_str) == Some(jsonrpc::VERSION)
                    && obj.get("method").map(Value::is_string).unwrap_or(false)
                    && !obj.contains_key("id") =>
            {
                Ok(())
            }
            _ => Err(McpError::Validation(
                "notification requires jsonrpc \"2.0\", a method and no id".to_string(),
            )),
        };
        if let Err(err) = checked {
            return match &self.on_error {
                Some(hook) => {
                    hook(&err);
                    Ok(None)
                }
                None => Err(err),
            };
        }
        Ok(Some(self.redact(&value)))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_decode_across_partial_chunks() {
        let mut codec = McpCodec::new();
        let mut buf = BytesMut::from(&b"{\"jsonrpc\":\"2"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b".0\",\"id\":1,\"result\":{}}\n");
        let frame = codec.decode(&mut buf).unwrap();
        assert_eq!(
            frame,
            Some(Frame::Message(json!({"jsonrpc": "2.0", "id": 1, "result": {}})))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple_lines_in_one_chunk() {
        let mut codec = McpCodec::new();
        let mut buf = BytesMut::from(&b"{\"id\":1}\r\n\n{\"id\":2}\n{\"id\""[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Message(json!({"id": 1}))));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Message(json!({"id": 2}))));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"{\"id\"");
    }

    #[test]
    fn test_malformed_line_is_not_fatal() {
        let mut codec = McpCodec::new();
        let mut buf = BytesMut::from(&b"not json\n{\"id\":3}\n"[..]);
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Malformed { line, .. }) => assert_eq!(line, "not json"),
            other => panic!("expected malformed frame, got {:?}", other),
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Message(json!({"id": 3}))));
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = McpCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(&json!({"jsonrpc": "2.0", "id": 1}), &mut dst).unwrap();
        assert_eq!(dst.last(), Some(&b'\n'));
        assert_eq!(dst.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_envelopes() {
        let codec = MessageCodec::default();
        assert!(codec.validate(&json!({"jsonrpc": "2.0", "id": "a"})).unwrap());
        assert!(codec.validate(&json!({"jsonrpc": "1.0", "id": 1})).is_err());
        assert!(codec.validate(&json!({"jsonrpc": "2.0"})).is_err());
        assert!(codec.validate(&json!({"jsonrpc": "2.0", "id": null})).is_err());
        assert!(codec.validate(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_validate_with_hook_swallows() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let codec = MessageCodec::default().with_error_hook(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!codec.validate(&json!({"jsonrpc": "2.0"})).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prepare_notification_rejects_id() {
        let codec = MessageCodec::default();
        let ok = codec
            .prepare_notification(&json!({"jsonrpc": "2.0", "method": "notifications/x"}))
            .unwrap();
        assert!(ok.is_some());
        assert!(codec
            .prepare_notification(&json!({"jsonrpc": "2.0", "method": "m", "id": 1}))
            .is_err());
    }

    #[test]
    fn test_redact_nested() {
        let codec = MessageCodec::default();
        let input = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "params": {
                "arguments": {
                    "API_KEY": "sk-live",
                    "nested": [{"password": "hunter2", "keep": "ok"}]
                }
            }
        });
        let out = codec.redact(&input);
        let wire = out.to_string();
        assert!(!wire.contains("sk-live"));
        assert!(!wire.contains("hunter2"));
        assert_eq!(out["params"]["arguments"]["nested"][0]["keep"], "ok");
        assert_eq!(out["params"]["arguments"]["API_KEY"], redaction::PLACEHOLDER);
    }
}
