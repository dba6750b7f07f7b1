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

//! Upstream process management with Zombie Process Protection.
//!
//! Spawns a tool-provider process with a restricted environment and binds its
//! lifetime to ours. Exit status is reported once through a oneshot channel.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::engine_core::errors::McpError;

/// How long a SIGTERM'd child gets before it is killed outright.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Builds an environment from the listed parent variables only.
///
/// Nothing else from the parent environment is passed through, so secrets in
/// the parent's environment do not leak into children.
pub fn minimal_env(inherit: &[&str]) -> Vec<(String, String)> {
    inherit
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}

/// What to launch.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Terminate,
    Kill,
}

pub struct ProcessSupervisor {
    pid: Option<u32>,
    // Channel to trigger termination
    control_tx: Option<oneshot::Sender<Control>>,
}

pub struct SpawnedProcess {
    pub supervisor: ProcessSupervisor,
    pub stdin: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    pub stdout: Option<Box<dyn AsyncRead + Unpin + Send>>,
    pub stderr: Option<Box<dyn AsyncRead + Unpin + Send>>,
    pub exit: oneshot::Receiver<ProcessExit>,
}

impl ProcessSupervisor {
    pub fn spawn(spec: &SpawnSpec) -> Result<SpawnedProcess, McpError> {
        debug!(
            "ProcessSupervisor: spawning '{}' with args {:?}",
            spec.program.display(),
            spec.args
        );

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        // ------------------------------------------------------------------
        // LINUX: PR_SET_PDEATHSIG
        // ------------------------------------------------------------------
        #[cfg(target_os = "linux")]
        // SAFETY: prctl is async-signal-safe and only touches the calling
        // (forked, pre-exec) process. PR_SET_PDEATHSIG with SIGKILL makes the
        // child die with its parent.
        unsafe {
            command.pre_exec(|| {
                let ret = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                if ret != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| {
            McpError::Transport(format!(
                "Failed to spawn '{}': {}",
                spec.program.display(),
                e
            ))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncWrite + Unpin + Send>);
        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>);

        let (control_tx, control_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            let exit = tokio::select! {
                control = control_rx => {
                    match control {
                        Ok(Control::Terminate) => terminate_child(&mut child, pid).await,
                        // Kill requested, or the supervisor was dropped.
                        Ok(Control::Kill) | Err(_) => {
                            let _ = child.kill().await;
                            wait_exit(&mut child).await
                        }
                    }
                }
                exit = wait_exit(&mut child) => exit,
            };
            debug!(?pid, ?exit, "Supervised process exited");
            let _ = exit_tx.send(exit);
        });

        Ok(SpawnedProcess {
            supervisor: Self {
                pid,
                control_tx: Some(control_tx),
            },
            stdin,
            stdout,
            stderr,
            exit: exit_rx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Sends SIGTERM, escalating to SIGKILL after a grace period.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(Control::Terminate);
        }
    }

    pub fn kill(&mut self) {
        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(Control::Kill);
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn wait_exit(child: &mut Child) -> ProcessExit {
    match child.wait().await {
        Ok(status) => exit_from_status(status),
        Err(e) => {
            warn!("Failed to wait on child process: {}", e);
            ProcessExit {
                code: None,
                signal: None,
            }
        }
    }
}

async fn terminate_child(child: &mut Child, pid: Option<u32>) -> ProcessExit {
    if !send_sigterm(pid) {
        let _ = child.start_kill();
    }
    match tokio::time::timeout(TERMINATE_GRACE, wait_exit(child)).await {
        Ok(exit) => exit,
        Err(_) => {
            warn!(?pid, "Process ignored SIGTERM, killing");
            let _ = child.kill().await;
            wait_exit(child).await
        }
    }
}

/// Delivers SIGTERM. Returns false where signals are unavailable.
pub(crate) fn send_sigterm(pid: Option<u32>) -> bool {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
            return kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok();
        }
        false
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = pid;
        false
    }
}

fn exit_from_status(status: std::process::ExitStatus) -> ProcessExit {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ProcessExit {
        code: status.code(),
        signal,
    }
}

/// Resolves `command` on `PATH` (or as a path), failing with a readable error.
pub fn resolve_command(command: &str, cwd: Option<&Path>) -> Result<PathBuf, McpError> {
    let found = match cwd {
        Some(dir) if command.contains(std::path::MAIN_SEPARATOR) => {
            which::which_in(command, std::env::var_os("PATH"), dir)
        }
        _ => which::which(command),
    };
    found.map_err(|_| {
        McpError::Transport(format!(
            "Command '{}' not found on PATH; install it or use an absolute path",
            command
        ))
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_minimal_env_only_inherits_listed() {
        let env = minimal_env(&["PATH"]);
        assert!(env.iter().all(|(k, _)| k == "PATH"));
    }

    #[test]
    fn test_resolve_missing_command() {
        let err = resolve_command("definitely-not-a-real-binary-4242", None).unwrap_err();
        assert!(err.to_string().contains("not found on PATH"));
    }

    #[tokio::test]
    async fn test_spawn_reports_exit_code() {
        let spec = SpawnSpec {
            program: resolve_command("sh", None).unwrap(),
            args: vec!["-c".into(), "echo hi; exit 3".into()],
            env: minimal_env(&["PATH"]),
            cwd: None,
        };
        let mut spawned = ProcessSupervisor::spawn(&spec).unwrap();
        let mut out = String::new();
        spawned
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out.trim(), "hi");
        let exit = spawned.exit.await.unwrap();
        assert_eq!(exit.code, Some(3));
    }

    #[tokio::test]
    async fn test_env_is_not_inherited() {
        std::env::set_var("LILITH_MCP_TEST_SECRET", "leak");
        let spec = SpawnSpec {
            program: resolve_command("sh", None).unwrap(),
            args: vec!["-c".into(), "echo \"[$LILITH_MCP_TEST_SECRET]\"".into()],
            env: minimal_env(&["PATH"]),
            cwd: None,
        };
        let mut spawned = ProcessSupervisor::spawn(&spec).unwrap();
        let mut out = String::new();
        spawned
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out.trim(), "[]");
    }

    #[tokio::test]
    async fn test_terminate_sends_sigterm() {
        let spec = SpawnSpec {
            program: resolve_command("sleep", None).unwrap(),
            args: vec!["30".into()],
            env: minimal_env(&["PATH"]),
            cwd: None,
        };
        let mut spawned = ProcessSupervisor::spawn(&spec).unwrap();
        spawned.supervisor.terminate();
        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, None);
        assert!(exit.signal.is_some());
    }
}
