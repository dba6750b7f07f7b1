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

//! HTTP transport: one POST per envelope, the response body comes back as an
//! event.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response, Url};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::sse::SseParser;
use super::{prepare, validate_url, HttpConfig, StateCell, Transport, TransportEvent, TransportState};
use crate::engine_core::constants::transport as defaults;
use crate::engine_core::errors::{McpError, McpResult};
use crate::mcp::codec::{ErrorHook, Frame, MessageCodec};

/// Converts configured header pairs, rejecting names or values reqwest would.
pub(crate) fn header_map(headers: &BTreeMap<String, String>) -> McpResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::Configuration(format!("Invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            McpError::Configuration(format!("Invalid value for header '{}': {}", name, e))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

/// How one POST attempt ended.
enum Attempt {
    Done(Response),
    Retry(McpError),
    Fatal(McpError),
}

pub struct HttpTransport {
    url: Url,
    client: Client,
    headers: HeaderMap,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    codec: MessageCodec,
    on_error: Option<ErrorHook>,
    state: StateCell,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> McpResult<Self> {
        let url = validate_url("url", &config.url)?;
        let headers = header_map(&config.headers)?;
        let client = Client::builder()
            .build()
            .map_err(|e| McpError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        let (events_tx, events_rx) = mpsc::channel(defaults::EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            url,
            client,
            headers,
            timeout: Duration::from_millis(
                config.timeout_ms.unwrap_or(defaults::DEFAULT_HTTP_TIMEOUT_MS),
            ),
            max_retries: config.max_retries.unwrap_or(defaults::DEFAULT_MAX_RETRIES),
            retry_delay: Duration::from_millis(
                config.retry_delay_ms.unwrap_or(defaults::DEFAULT_RETRY_DELAY_MS),
            ),
            codec: MessageCodec::default(),
            on_error: None,
            state: StateCell::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn with_codec(mut self, codec: MessageCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Failures that survive every retry go to `hook` and `send` returns `Ok`.
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.on_error = Some(hook);
        self
    }

    async fn attempt(&self, envelope: &Value) -> Attempt {
        let result = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .timeout(self.timeout)
            .json(envelope)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => Attempt::Done(resp),
            Ok(resp) if resp.status().is_server_error() => Attempt::Retry(McpError::Transport(
                format!("HTTP {} from {}", resp.status(), self.url),
            )),
            Ok(resp) => Attempt::Fatal(McpError::Transport(format!(
                "HTTP {} from {}",
                resp.status(),
                self.url
            ))),
            // The abort deadline fired; retrying would multiply the wait.
            Err(e) if e.is_timeout() => Attempt::Fatal(McpError::Timeout(self.timeout)),
            Err(e) => Attempt::Retry(McpError::Transport(format!(
                "HTTP request to {} failed: {}",
                self.url, e
            ))),
        }
    }

    async fn emit_body(&self, resp: Response) {
        let is_stream = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with(defaults::SSE_MIME_TYPE))
            .unwrap_or(false);

        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let err = if e.is_timeout() {
                    McpError::Timeout(self.timeout)
                } else {
                    McpError::Transport(format!("Failed to read response body: {}", e))
                };
                let _ = self.events_tx.send(TransportEvent::Error(err)).await;
                return;
            }
        };
        if body.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let frames = if is_stream {
            let mut parser = SseParser::new();
            let mut frames = match parser.push(&body) {
                Ok(frames) => frames,
                Err(e) => {
                    let _ = self.events_tx.send(TransportEvent::Error(e)).await;
                    return;
                }
            };
            frames.extend(parser.finish());
            frames
        } else {
            vec![match serde_json::from_slice::<Value>(&body) {
                Ok(value) => Frame::Message(value),
                Err(e) => Frame::Malformed {
                    line: String::from_utf8_lossy(&body).into_owned(),
                    error: e.to_string(),
                },
            }]
        };

        for frame in frames {
            let event = match frame {
                Frame::Message(value) => {
                    debug!(message = %value, "http <-");
                    TransportEvent::Message(value)
                }
                Frame::Malformed { error, .. } => {
                    warn!("Unparsable HTTP response body: {}", error);
                    TransportEvent::Error(McpError::Validation(format!(
                        "Unparsable response body: {}",
                        error
                    )))
                }
            };
            if self.events_tx.send(event).await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn connect(&self) -> McpResult<()> {
        self.state.set(TransportState::Connected);
        info!(url = %self.url, "http transport ready");
        Ok(())
    }

    async fn send(&self, message: &Value) -> McpResult<()> {
        let Some(envelope) = prepare(&self.codec, message)? else {
            return Ok(());
        };
        if self.state.get() != TransportState::Connected {
            return Err(McpError::Transport("http transport is not connected".to_string()));
        }
        debug!(message = %envelope, "http ->");

        let mut attempt = 0u32;
        let err = loop {
            match self.attempt(&envelope).await {
                Attempt::Done(resp) => {
                    self.emit_body(resp).await;
                    return Ok(());
                }
                Attempt::Fatal(err) => break err,
                Attempt::Retry(err) if attempt >= self.max_retries => break err,
                Attempt::Retry(err) => {
                    attempt += 1;
                    warn!(attempt, max = self.max_retries, "{}; retrying", err);
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
            }
        };

        match &self.on_error {
            Some(hook) => {
                hook(&err);
                Ok(())
            }
            None => Err(err),
        }
    }

    async fn disconnect(&self) -> McpResult<()> {
        self.state.set(TransportState::Disconnected);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}
