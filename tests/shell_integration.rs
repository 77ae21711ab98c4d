//! Shell service over a full session with a real PTY.

mod common;

use common::spawn_local_session;
use serde_json::json;
use std::time::Duration;

const IDLE: Duration = Duration::from_secs(60);

#[tokio::test]
async fn shell_start_echo_terminate() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut session = spawn_local_session(dir.path(), IDLE);

    session
        .send("shell", "s1", "start", Some(json!({"cwd": "/tmp"})))
        .await;
    let ack = session.recv_until(|e| e.action == "start").await;
    assert_eq!(ack.service, "shell");
    assert_eq!(ack.id, "s1");
    assert!(ack.error.is_none());

    session
        .send(
            "shell",
            "s1",
            "command",
            Some(json!("echo WEBSHELL_E2E_MARKER\n")),
        )
        .await;

    // Output arrives as one or more `command` frames whose data is a JSON
    // string of raw terminal bytes; concatenate until the marker shows up.
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !collected.contains("WEBSHELL_E2E_MARKER") {
        assert!(
            tokio::time::Instant::now() < deadline,
            "marker not seen in shell output: {collected}"
        );
        let frame = session.recv_until(|e| e.action == "command").await;
        if let Some(serde_json::Value::String(text)) = frame.data {
            collected.push_str(&text);
        }
    }

    session.send("shell", "s1", "resize", Some(json!({"rows": 40, "cols": 120}))).await;
    session.send("shell", "s1", "terminate", None).await;

    // The session is still healthy afterwards.
    session.send("heartbeat", "h", "ping", None).await;
    let echo = session.recv_until(|e| e.service == "heartbeat").await;
    assert_eq!(echo.action, "ping");
}

#[tokio::test]
async fn command_before_start_is_dropped_silently() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut session = spawn_local_session(dir.path(), IDLE);

    session
        .send("shell", "ghost", "command", Some(json!("ls\n")))
        .await;
    session.send("heartbeat", "h", "ping", None).await;

    // Only the heartbeat echo comes back.
    let echo = session.recv_envelope().await;
    assert_eq!(echo.service, "heartbeat");
}
