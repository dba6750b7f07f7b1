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

//! Server-Sent Events transport: a long-lived GET for inbound messages and an
//! optional POST endpoint for outbound ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Url};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http::header_map;
use super::{prepare, validate_url, SseConfig, StateCell, Transport, TransportEvent, TransportState};
use crate::engine_core::constants::{limits, transport as defaults};
use crate::engine_core::errors::{McpError, McpResult};
use crate::mcp::codec::{Frame, MessageCodec};

/// Incremental `text/event-stream` reassembly.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence. Only
/// the `data` field is used; comments and other fields are skipped.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Bytes already searched for a delimiter.
    scanned: usize,
    limit: usize,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_limit(limits::MAX_MESSAGE_SIZE_BYTES as usize)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser that fails once a single unfinished event exceeds `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Feeds a chunk and returns every event it completed.
    ///
    /// An unterminated event larger than the limit is a fatal error; the
    /// stream cannot be resynchronised after it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, McpError> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        loop {
            // Back up one byte: the previous chunk may have ended on `\n`.
            let start = self.scanned.saturating_sub(1);
            let Some(offset) = self.buffer[start..].windows(2).position(|w| w == b"\n\n") else {
                self.scanned = self.buffer.len();
                break;
            };
            let pos = start + offset;
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.scanned = 0;
            if let Some(frame) = parse_block(&block[..pos]) {
                frames.push(frame);
            }
        }

        if self.buffer.len() > self.limit {
            self.buffer.clear();
            self.scanned = 0;
            return Err(McpError::Transport(format!(
                "SSE event exceeded size limit of {} bytes",
                self.limit
            )));
        }
        Ok(frames)
    }

    /// Flushes a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Vec<Frame> {
        self.scanned = 0;
        let block = std::mem::take(&mut self.buffer);
        parse_block(&block).into_iter().collect()
    }
}

fn parse_block(block: &[u8]) -> Option<Frame> {
    let text = String::from_utf8_lossy(block);
    let mut data: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            data.push(value);
        }
    }
    if data.is_empty() {
        return None;
    }

    let payload = data.join("\n");
    Some(match serde_json::from_str::<Value>(&payload) {
        Ok(value) => Frame::Message(value),
        Err(e) => Frame::Malformed {
            line: payload,
            error: e.to_string(),
        },
    })
}

pub struct SseTransport {
    url: Url,
    write_url: Option<Url>,
    client: Client,
    headers: HeaderMap,
    timeout: Duration,
    codec: MessageCodec,
    state: Arc<StateCell>,
    connected: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl SseTransport {
    pub fn new(config: SseConfig) -> McpResult<Self> {
        let url = validate_url("url", &config.url)?;
        let write_url = config
            .write_url
            .as_deref()
            .map(|raw| validate_url("writeUrl", raw))
            .transpose()?;
        let timeout =
            Duration::from_millis(config.timeout_ms.unwrap_or(defaults::DEFAULT_HTTP_TIMEOUT_MS));
        // No overall timeout on the client: the event stream is long-lived.
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| McpError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        let (events_tx, events_rx) = mpsc::channel(defaults::EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            url,
            write_url,
            client,
            headers: header_map(&config.headers)?,
            timeout,
            codec: MessageCodec::default(),
            state: Arc::new(StateCell::new()),
            connected: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn with_codec(mut self, codec: MessageCodec) -> Self {
        self.codec = codec;
        self
    }

    fn replace_cancel(&self, token: Option<CancellationToken>) {
        if let Ok(mut slot) = self.cancel.lock() {
            if let Some(old) = std::mem::replace(&mut *slot, token) {
                old.cancel();
            }
        }
    }

    /// Marks the transport connected and pumps `stream` into the event channel.
    fn start_pump<S, E>(&self, stream: S)
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let token = CancellationToken::new();
        self.replace_cancel(Some(token.clone()));
        self.connected.store(true, Ordering::SeqCst);
        self.state.set(TransportState::Connected);
        tokio::spawn(pump(
            stream,
            token,
            self.connected.clone(),
            self.state.clone(),
            self.events_tx.clone(),
        ));
    }
}

/// Reads the event stream until it ends, fails or is cancelled.
///
/// Every event is delivered through a reserved permit taken while racing the
/// cancellation token, and the connected flag is re-checked once the permit is
/// held, so nothing is emitted after `disconnect()` even when the channel was
/// full.
async fn pump<S, E>(
    stream: S,
    token: CancellationToken,
    connected: Arc<AtomicBool>,
    state: Arc<StateCell>,
    tx: mpsc::Sender<TransportEvent>,
) where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let mut stream = Box::pin(stream);
    let mut parser = SseParser::new();
    let end = loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            chunk = stream.next() => chunk,
        };
        let frames = match chunk {
            Some(Ok(bytes)) => match parser.push(&bytes) {
                Ok(frames) => frames,
                Err(e) => break e,
            },
            Some(Err(e)) => break McpError::Transport(format!("SSE stream failed: {}", e)),
            None => break McpError::Transport("SSE stream ended".to_string()),
        };
        for frame in frames {
            let event = match frame {
                Frame::Message(value) => {
                    debug!(message = %value, "sse <-");
                    TransportEvent::Message(value)
                }
                Frame::Malformed { error, .. } => {
                    warn!("Malformed SSE payload: {}", error);
                    TransportEvent::Error(McpError::Validation(format!(
                        "Malformed SSE payload: {}",
                        error
                    )))
                }
            };
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            if !connected.load(Ordering::SeqCst) {
                return;
            }
            permit.send(event);
        }
    };

    if connected.swap(false, Ordering::SeqCst) {
        state.set(TransportState::Disconnected);
        warn!("{}", end);
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = tx.send(TransportEvent::Error(end)) => {}
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> &'static str {
        "sse"
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn connect(&self) -> McpResult<()> {
        if self.url.scheme() != "https" {
            return Err(McpError::Transport(format!(
                "SSE transport requires an https URL; refusing {}",
                self.url
            )));
        }
        if !self
            .state
            .transition(TransportState::Disconnected, TransportState::Connecting)
        {
            return match self.state.get() {
                TransportState::Connected => Ok(()),
                _ => Err(McpError::Transport("connect already in progress".to_string())),
            };
        }

        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, defaults::SSE_MIME_TYPE)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.state.set(TransportState::Disconnected);
                return Err(McpError::Transport(format!(
                    "Failed to open event stream {}: {}",
                    self.url, e
                )));
            }
        };
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with(defaults::SSE_MIME_TYPE) {
            warn!(content_type, "Event stream served with unexpected content type");
        }

        self.start_pump(response.bytes_stream());
        info!(url = %self.url, "sse transport connected");
        Ok(())
    }

    async fn send(&self, message: &Value) -> McpResult<()> {
        let Some(write_url) = &self.write_url else {
            return Err(McpError::Transport(
                "SSE transport has no writeUrl; it cannot send".to_string(),
            ));
        };
        let Some(envelope) = prepare(&self.codec, message)? else {
            return Ok(());
        };
        if self.state.get() != TransportState::Connected {
            return Err(McpError::Transport("sse transport is not connected".to_string()));
        }

        debug!(message = %envelope, "sse ->");
        let response = self
            .client
            .post(write_url.clone())
            .headers(self.headers.clone())
            .timeout(self.timeout)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    McpError::Timeout(self.timeout)
                } else {
                    McpError::Transport(format!("POST to {} failed: {}", write_url, e))
                }
            })?;
        if !response.status().is_success() {
            return Err(McpError::Transport(format!(
                "HTTP {} from {}",
                response.status(),
                write_url
            )));
        }
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.state.set(TransportState::Disconnected);
        self.replace_cancel(None);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.replace_cancel(None);
    }
}
