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

//! Child-process transport: one JSON document per line over stdin/stdout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{prepare, StateCell, StdioConfig, Transport, TransportEvent, TransportState};
use crate::engine_core::constants::transport as defaults;
use crate::engine_core::errors::{McpError, McpResult};
use crate::mcp::codec::MessageCodec;
use crate::mcp::pipeline::{spawn_upstream_reader, spawn_upstream_stderr_drain};
use crate::mcp::process::{minimal_env, resolve_command, ProcessSupervisor, SpawnSpec};

struct Session {
    stdin: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    supervisor: ProcessSupervisor,
    pumps: Vec<JoinHandle<()>>,
    exit_watcher: JoinHandle<()>,
}

pub struct StdioTransport {
    config: StdioConfig,
    codec: MessageCodec,
    state: Arc<StateCell>,
    // Bumped per spawn so a stale exit watcher cannot touch a newer session.
    generation: Arc<AtomicU64>,
    session: AsyncMutex<Option<Session>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(defaults::EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            codec: MessageCodec::default(),
            state: Arc::new(StateCell::new()),
            generation: Arc::new(AtomicU64::new(0)),
            session: AsyncMutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn with_codec(mut self, codec: MessageCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &StdioConfig {
        &self.config
    }

    fn spawn_spec(&self) -> McpResult<SpawnSpec> {
        let program = resolve_command(&self.config.command, self.config.cwd.as_deref())?;
        let mut env = minimal_env(defaults::INHERITED_ENV);
        for (key, value) in &self.config.env {
            env.retain(|(k, _)| k != key);
            env.push((key.clone(), value.clone()));
        }
        Ok(SpawnSpec {
            program,
            args: self.config.args.clone(),
            env,
            cwd: self.config.cwd.clone(),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> &'static str {
        "stdio"
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn connect(&self) -> McpResult<()> {
        if !self
            .state
            .transition(TransportState::Disconnected, TransportState::Connecting)
        {
            return match self.state.get() {
                TransportState::Connected => Ok(()),
                _ => Err(McpError::Transport("connect already in progress".to_string())),
            };
        }

        let spawned = match self.spawn_spec().and_then(|spec| ProcessSupervisor::spawn(&spec)) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.state.set(TransportState::Disconnected);
                return Err(e);
            }
        };

        let mut session = self.session.lock().await;
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = spawned.stdout {
            pumps.push(spawn_upstream_reader(stdout, self.events_tx.clone()));
        }
        if let Some(stderr) = spawned.stderr {
            pumps.push(spawn_upstream_stderr_drain(stderr, self.config.command.clone()));
        }
        info!(
            command = %self.config.command,
            pid = ?spawned.supervisor.pid(),
            "stdio transport connected"
        );
        self.state.set(TransportState::Connected);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let exit_rx = spawned.exit;
        let state = self.state.clone();
        let current = self.generation.clone();
        let tx = self.events_tx.clone();
        let exit_watcher = tokio::spawn(async move {
            let exit = exit_rx.await.ok();
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            // disconnect() moves to Disconnected first, so only an
            // unexpected exit wins this transition.
            if state.transition(TransportState::Connected, TransportState::Disconnected) {
                let (code, signal) = exit.map(|e| (e.code, e.signal)).unwrap_or((None, None));
                warn!(?code, ?signal, "Upstream process exited");
                let _ = tx.send(TransportEvent::Exit { code, signal }).await;
            }
        });

        *session = Some(Session {
            stdin: spawned.stdin,
            supervisor: spawned.supervisor,
            pumps,
            exit_watcher,
        });
        Ok(())
    }

    async fn send(&self, message: &Value) -> McpResult<()> {
        let Some(envelope) = prepare(&self.codec, message)? else {
            return Ok(());
        };
        if self.state.get() != TransportState::Connected {
            return Err(McpError::Transport("stdio transport is not connected".to_string()));
        }

        let mut line = serde_json::to_vec(&envelope)
            .map_err(|e| McpError::Validation(format!("Failed to serialize message: {}", e)))?;
        line.push(b'\n');

        let mut session = self.session.lock().await;
        let stdin = session
            .as_mut()
            .and_then(|s| s.stdin.as_mut())
            .ok_or_else(|| McpError::Transport("upstream stdin is not available".to_string()))?;
        stdin
            .write_all(&line)
            .await
            .map_err(|e| McpError::Transport(format!("Failed to write to upstream stdin: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("Failed to flush upstream stdin: {}", e)))?;
        debug!(message = %envelope, "upstream ->");
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        self.state.set(TransportState::Disconnected);
        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            // Closing stdin first lets well-behaved servers exit on EOF.
            drop(session.stdin.take());
            session.supervisor.terminate();
            for pump in &session.pumps {
                pump.abort();
            }
            info!(command = %self.config.command, "stdio transport disconnected");
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().as_mut() {
            session.supervisor.kill();
            session.exit_watcher.abort();
            for pump in &session.pumps {
                pump.abort();
            }
        }
    }
}
