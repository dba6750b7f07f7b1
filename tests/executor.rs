#![cfg(unix)]

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use lilith_mcp::mcp::executor::{ExecutorConfig, SecureExecutor};
use lilith_mcp::McpError;

fn executor(max_concurrent: usize, max_output_bytes: usize) -> SecureExecutor {
    SecureExecutor::new(ExecutorConfig {
        allowed_commands: vec!["sleep".into(), "cat".into(), "echo".into()],
        max_concurrent,
        max_output_bytes,
        default_timeout_ms: 5_000,
    })
    .unwrap()
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_calls_over_capacity_are_rejected_immediately() {
    let exec = executor(2, 4096);
    let cmd = argv(&["sleep", "0.2"]);

    // Each call takes its slot before its first await, so under join_all the
    // first two hold both slots while the other four are polled.
    let (exec_ref, cmd_ref) = (&exec, &cmd);
    let results = join_all((0..6).map(move |_| async move {
        let started = Instant::now();
        let result = exec_ref.execute_command(cmd_ref, None).await;
        (result, started.elapsed())
    }))
    .await;

    let ok = results.iter().filter(|(r, _)| r.is_ok()).count();
    let rejected: Vec<Duration> = results
        .iter()
        .filter(|(r, _)| matches!(r, Err(McpError::Capacity(_))))
        .map(|(_, elapsed)| *elapsed)
        .collect();
    assert_eq!(ok, 2);
    assert_eq!(rejected.len(), 4);
    for elapsed in rejected {
        assert!(elapsed < Duration::from_millis(100), "rejection took {:?}", elapsed);
    }
    assert_eq!(exec.active_processes(), 0);
}

#[tokio::test]
async fn test_slots_never_leak_across_outcomes() {
    let exec = executor(2, 4096);
    let baseline = exec.active_processes();
    assert_eq!(baseline, 0);

    // 3x the cap, run one after another through every exit path.
    for round in 0..6 {
        let result = match round % 3 {
            0 => exec.execute_command(&argv(&["echo", "ok"]), None).await,
            1 => exec.execute_command(&argv(&["sleep", "bogus"]), None).await,
            _ => {
                exec.execute_command(&argv(&["sleep", "5"]), Some(Duration::from_millis(50)))
                    .await
            }
        };
        match round % 3 {
            0 => assert_eq!(result.unwrap().exit_code, Some(0)),
            1 => assert_ne!(result.unwrap().exit_code, Some(0)),
            _ => assert!(matches!(result, Err(McpError::Timeout(_)))),
        }
        assert_eq!(exec.active_processes(), baseline, "leak after round {}", round);
    }

    let out = exec.execute_command(&argv(&["echo", "again"]), None).await.unwrap();
    assert_eq!(out.stdout.trim(), "again");
    assert_eq!(exec.active_processes(), baseline);
}

#[tokio::test]
async fn test_timeout_kills_the_child() {
    let exec = executor(1, 4096);
    let started = Instant::now();
    let err = exec
        .execute_command(&argv(&["sleep", "10"]), Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Timeout(_)), "got {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(exec.active_processes(), 0);
}

#[tokio::test]
async fn test_output_cap() {
    let dir = tempfile::tempdir().unwrap();
    let big = dir.path().join("big.txt");
    std::fs::write(&big, "x".repeat(4096)).unwrap();

    let exec = executor(1, 1024);
    let err = exec
        .execute_command(&argv(&["cat", big.to_str().unwrap()]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::OutputExceeded { limit: 1024 }), "got {:?}", err);
    assert_eq!(exec.active_processes(), 0);
}

#[tokio::test]
async fn test_rejected_commands_never_spawn() {
    let exec = executor(1, 4096);
    let denied = exec.execute_command(&argv(&["rm", "-rf", "/tmp/x"]), None).await;
    assert!(matches!(denied, Err(McpError::ToolExecution { ref code, .. }) if code == "E_ACCESS_DENIED"));

    let path = exec.execute_command(&argv(&["/bin/echo", "hi"]), None).await;
    assert!(matches!(path, Err(McpError::ToolExecution { .. })));

    let injected = exec.execute_command(&argv(&["echo", "a; rm -rf /"]), None).await;
    assert!(matches!(injected, Err(McpError::Validation(_))));
    assert_eq!(exec.active_processes(), 0);
}
