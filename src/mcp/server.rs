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

//! Newline-delimited JSON-RPC server loop.
//!
//! Reads requests from any `AsyncRead`, hands each to the dispatcher on its
//! own task and funnels responses and notifications through a single writer
//! so lines never interleave.

use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, error, info, warn};

use crate::engine_core::constants::jsonrpc;
use crate::engine_core::errors::McpResult;
use crate::engine_core::models::JsonRpcResponse;
use crate::mcp::codec::{Frame, McpCodec};
use crate::mcp::dispatcher::Dispatcher;

const OUTBOUND_CAPACITY: usize = 256;

pub struct StdioServer {
    dispatcher: Arc<Dispatcher>,
}

impl StdioServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Serves on the process's stdin/stdout until EOF or Ctrl-C.
    pub async fn run(&self) -> McpResult<()> {
        tokio::select! {
            result = self.serve(tokio::io::stdin(), tokio::io::stdout()) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                Ok(())
            }
        }
    }

    /// Serves until `reader` reaches EOF, then waits for in-flight responses.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> McpResult<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel::<Value>(OUTBOUND_CAPACITY);
        let writer_task = tokio::spawn(write_loop(writer, out_rx));

        let forwarder = self.dispatcher.take_notifications().map(|mut notes| {
            let tx = out_tx.clone();
            tokio::spawn(async move {
                while let Some(note) = notes.recv().await {
                    match serde_json::to_value(&note) {
                        Ok(value) => {
                            if tx.send(value).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to serialize notification: {}", e),
                    }
                }
            })
        });

        let mut framed = FramedRead::new(reader, McpCodec::new());
        while let Some(frame) = framed.next().await {
            match frame {
                Ok(Frame::Message(value)) => {
                    let dispatcher = self.dispatcher.clone();
                    let tx = out_tx.clone();
                    tokio::spawn(async move {
                        if let Some(response) = dispatcher.handle_value(value).await {
                            send_response(&tx, &response).await;
                        }
                    });
                }
                Ok(Frame::Malformed { error, .. }) => {
                    warn!("Parse error on inbound line: {}", error);
                    let response =
                        JsonRpcResponse::failure(None, jsonrpc::ERROR_PARSE, "Parse error");
                    send_response(&out_tx, &response).await;
                }
                Err(e) => {
                    error!("Framing error, closing connection: {}", e);
                    break;
                }
            }
        }
        debug!("Input closed");

        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        drop(out_tx);
        match writer_task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Writer task failed: {}", e);
                Ok(())
            }
        }
    }
}

async fn send_response(tx: &mpsc::Sender<Value>, response: &JsonRpcResponse) {
    match serde_json::to_value(response) {
        Ok(value) => {
            let _ = tx.send(value).await;
        }
        Err(e) => error!("Failed to serialize response: {}", e),
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Value>) -> McpResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut codec = McpCodec::new();
    let mut buf = BytesMut::new();
    while let Some(value) = rx.recv().await {
        buf.clear();
        codec.encode(&value, &mut buf)?;
        debug!(message = %value, "server ->");
        writer.write_all(&buf).await?;
        writer.flush().await?;
    }
    Ok(())
}
