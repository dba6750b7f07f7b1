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

//! Background pumps between a child's pipes and a transport's event channel.

use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, warn};

use crate::engine_core::errors::McpError;
use crate::mcp::codec::{Frame, McpCodec};
use crate::mcp::transport::TransportEvent;

/// Spawns a background task to read from Upstream Stdout (using McpCodec for framing)
///
/// Each complete line becomes a `Message`; a line that is not JSON becomes a
/// non-fatal `Error` and reading continues. The task ends on EOF, on a fatal
/// framing error, or when the receiver is gone.
pub fn spawn_upstream_reader<R>(stream: R, tx: mpsc::Sender<TransportEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framed = FramedRead::new(stream, McpCodec::new());

        while let Some(result) = framed.next().await {
            let event = match result {
                Ok(Frame::Message(value)) => {
                    debug!(message = %value, "upstream <-");
                    TransportEvent::Message(value)
                }
                Ok(Frame::Malformed { line, error }) => {
                    warn!("Upstream sent malformed line ({}): {}", error, truncate(&line));
                    TransportEvent::Error(McpError::Validation(format!(
                        "Malformed message from upstream: {}",
                        error
                    )))
                }
                Err(e) => {
                    error!("Upstream framing error: {}", e);
                    let _ = tx.send(TransportEvent::Error(e)).await;
                    break;
                }
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
        debug!("Upstream stdout closed");
    })
}

/// Spawns a background task to drain Upstream Stderr into the debug log.
///
/// stderr output is diagnostics, never a failure.
pub fn spawn_upstream_stderr_drain<R>(stream: R, label: String) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        debug!(upstream = %label, "stderr: {}", line);
                    }
                }
                Ok(None) => break, // Pipe closed
                Err(_) => break,
            }
        }
    })
}

fn truncate(line: &str) -> &str {
    const MAX: usize = 120;
    if line.len() <= MAX {
        return line;
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}
