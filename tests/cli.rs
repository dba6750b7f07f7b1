use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_watch_flags() {
    Command::cargo_bin("lilith-mcp")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--prompts-dir"))
        .stdout(predicate::str::contains("--debounce-ms"));
}

#[test]
fn test_invalid_debounce_fails_fast() {
    Command::cargo_bin("lilith-mcp")
        .unwrap()
        .args(["--debounce-ms", "5"])
        .write_stdin("")
        .assert()
        .failure();
}

#[test]
fn test_serves_initialize_on_stdin() {
    let request = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26"}}"#;
    Command::cargo_bin("lilith-mcp")
        .unwrap()
        .arg("--no-exec")
        .env("RUST_LOG", "off")
        .write_stdin(format!("{}\n", request))
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""protocolVersion":"2025-03-26""#));
}
