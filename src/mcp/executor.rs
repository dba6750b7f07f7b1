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

//! Secure Process Executor.
//!
//! Runs allow-listed commands without a shell, under a global concurrency
//! cap, with a minimal environment, capped output and a wall-clock timeout.
//! This is defense in depth for tool handlers, not an OS sandbox.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::engine_core::constants::executor as defaults;
use crate::engine_core::errors::{McpError, McpResult};
use crate::mcp::process::{minimal_env, resolve_command, send_sigterm};
use crate::utils::security::{contains_injection, OutputSanitizer};

/// Grace period between SIGTERM and SIGKILL on timeout.
const KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Bare command names that may be spawned.
    pub allowed_commands: Vec<String>,
    pub max_concurrent: usize,
    /// Per-stream cap on captured output.
    pub max_output_bytes: usize,
    pub default_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            allowed_commands: defaults::DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            max_concurrent: defaults::DEFAULT_MAX_CONCURRENT,
            max_output_bytes: defaults::DEFAULT_MAX_OUTPUT_BYTES,
            default_timeout_ms: defaults::DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> McpResult<()> {
        if !(1..=defaults::MAX_CONCURRENT_UPPER_BOUND).contains(&self.max_concurrent) {
            return Err(McpError::Configuration(format!(
                "max concurrent processes must be within 1..={}, got {}",
                defaults::MAX_CONCURRENT_UPPER_BOUND,
                self.max_concurrent
            )));
        }
        if self.max_output_bytes < defaults::MIN_OUTPUT_BYTES {
            return Err(McpError::Configuration(format!(
                "max output bytes must be at least {}, got {}",
                defaults::MIN_OUTPUT_BYTES,
                self.max_output_bytes
            )));
        }
        if self.default_timeout_ms == 0 {
            return Err(McpError::Configuration("default timeout must be non-zero".into()));
        }
        if let Some(bad) = self
            .allowed_commands
            .iter()
            .find(|c| c.is_empty() || c.contains(['/', '\\']))
        {
            return Err(McpError::Configuration(format!(
                "allow-list entries must be bare command names, got '{}'",
                bad
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
}

/// Holds one unit of the concurrency budget until dropped.
struct ProcessSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for ProcessSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub struct SecureExecutor {
    config: ExecutorConfig,
    active: Arc<AtomicUsize>,
}

impl SecureExecutor {
    pub fn new(config: ExecutorConfig) -> McpResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn active_processes(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Claims a slot or fails immediately; callers retry, nothing queues.
    fn try_acquire(&self) -> McpResult<ProcessSlot> {
        let max = self.config.max_concurrent;
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= max {
                return Err(McpError::Capacity(format!(
                    "{} of {} process slots in use",
                    current, max
                )));
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(ProcessSlot {
                        active: self.active.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Checks the allow-list and screens every argument.
    pub fn validate_argv(&self, argv: &[String]) -> McpResult<()> {
        let program = argv
            .first()
            .ok_or_else(|| McpError::Validation("argv must not be empty".to_string()))?;
        if program.contains(['/', '\\']) || !self.config.allowed_commands.contains(program) {
            return Err(McpError::tool(
                "E_ACCESS_DENIED",
                format!("Command '{}' is not allowed", program),
            ));
        }
        if let Some(arg) = argv.iter().find(|a| contains_injection(a)) {
            return Err(McpError::Validation(format!(
                "Argument {:?} contains forbidden shell metacharacters",
                arg
            )));
        }
        Ok(())
    }

    /// Runs `argv` and returns its sanitized output.
    pub async fn execute_command(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> McpResult<CommandOutput> {
        self.validate_argv(argv)?;
        let _slot = self.try_acquire()?;
        let timeout = timeout.unwrap_or(Duration::from_millis(self.config.default_timeout_ms));
        let program = resolve_command(&argv[0], None)?;

        let mut child = Command::new(&program)
            .args(&argv[1..])
            .env_clear()
            .envs(minimal_env(defaults::INHERITED_ENV))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::tool("E_SPAWN_FAILED", format!("Failed to spawn '{}': {}", argv[0], e)))?;

        let started = Instant::now();
        let limit = self.config.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = tokio::time::timeout(timeout, async {
            let (out, err) =
                tokio::try_join!(read_capped(stdout, limit), read_capped(stderr, limit))?;
            let status = child.wait().await?;
            Ok::<_, McpError>((out, err, status))
        })
        .await;

        match outcome {
            Ok(Ok((out, err, status))) => {
                info!(
                    command = %argv[0],
                    exit_code = ?status.code(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Command finished"
                );
                Ok(CommandOutput {
                    stdout: OutputSanitizer::sanitize(&String::from_utf8_lossy(&out)),
                    stderr: OutputSanitizer::sanitize(&String::from_utf8_lossy(&err)),
                    exit_code: status.code(),
                })
            }
            Ok(Err(e)) => {
                warn!(command = %argv[0], "Command failed: {}", e);
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(e)
            }
            Err(_) => {
                warn!(command = %argv[0], timeout_ms = timeout.as_millis() as u64, "Command timed out");
                if !send_sigterm(child.id()) {
                    let _ = child.start_kill();
                }
                if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                    debug!(command = %argv[0], "Escalating to SIGKILL");
                    let _ = child.kill().await;
                }
                Err(McpError::Timeout(timeout))
            }
        }
    }
}

async fn read_capped<R>(stream: Option<R>, limit: usize) -> McpResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return Ok(Vec::new());
    };
    let mut collected = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(collected);
        }
        if collected.len() + n > limit {
            return Err(McpError::OutputExceeded { limit });
        }
        collected.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(max: usize) -> SecureExecutor {
        SecureExecutor::new(ExecutorConfig {
            max_concurrent: max,
            ..ExecutorConfig::default()
        })
        .unwrap()
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_config_bounds() {
        let bad = ExecutorConfig {
            max_concurrent: 0,
            ..ExecutorConfig::default()
        };
        assert!(SecureExecutor::new(bad).is_err());
        let bad = ExecutorConfig {
            allowed_commands: vec!["/bin/ls".into()],
            ..ExecutorConfig::default()
        };
        assert!(SecureExecutor::new(bad).is_err());
    }

    #[test]
    fn test_allow_list_and_paths() {
        let exec = executor(1);
        assert!(exec.validate_argv(&argv(&["ls", "-la"])).is_ok());
        for denied in [&["rm", "-rf", "/"][..], &["/bin/ls"][..], &["../ls"][..]] {
            let err = exec.validate_argv(&argv(denied)).unwrap_err();
            assert!(matches!(err, McpError::ToolExecution { ref code, .. } if code == "E_ACCESS_DENIED"));
        }
        assert!(matches!(
            exec.validate_argv(&argv(&["echo", "hi; rm -rf /"])),
            Err(McpError::Validation(_))
        ));
        assert!(matches!(exec.validate_argv(&[]), Err(McpError::Validation(_))));
    }

    #[test]
    fn test_slots_are_released() {
        let exec = executor(2);
        let a = exec.try_acquire().unwrap();
        let _b = exec.try_acquire().unwrap();
        assert!(matches!(exec.try_acquire(), Err(McpError::Capacity(_))));
        drop(a);
        assert_eq!(exec.active_processes(), 1);
        assert!(exec.try_acquire().is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_output_sanitized() {
        let exec = executor(1);
        let out = exec
            .execute_command(&argv(&["echo", "javascript:alert(1)"]), None)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "alert(1)");
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(exec.active_processes(), 0);
    }
}
