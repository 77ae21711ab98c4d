//! End-to-end session tests over the in-memory transport: real dispatcher,
//! real claim routing, real services on a temp directory.

mod common;

use common::spawn_local_session;
use serde_json::json;
use sha2::Digest;
use std::time::Duration;

const IDLE: Duration = Duration::from_secs(60);

#[tokio::test]
async fn heartbeat_is_echoed() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut session = spawn_local_session(dir.path(), IDLE);

    session.send("heartbeat", "h", "ping", None).await;

    let echo = session.recv_envelope().await;
    assert_eq!(echo.service, "heartbeat");
    assert_eq!(echo.id, "h");
    assert_eq!(echo.action, "ping");
}

#[tokio::test]
async fn unknown_service_is_ignored_but_session_survives() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut session = spawn_local_session(dir.path(), IDLE);

    session.send("nonsense", "x", "boom", None).await;
    session.send("heartbeat", "h", "ping", None).await;

    let echo = session.recv_envelope().await;
    assert_eq!(echo.service, "heartbeat");
}

#[tokio::test]
async fn upload_hello_world_in_two_chunks() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("x");
    let id = dest.to_str().unwrap();
    let mut session = spawn_local_session(dir.path(), IDLE);

    session
        .send("upload", id, "start_session", Some(json!({"policy": "overwrite"})))
        .await;
    let reply = session.recv_envelope().await;
    assert_eq!(reply.data.as_ref().unwrap()["needConfirm"], false);

    session
        .send("upload", id, "start_file", Some(json!({"path": id})))
        .await;
    let reply = session.recv_envelope().await;
    assert_eq!(reply.data.as_ref().unwrap()["skip"], false);

    session
        .send("upload", id, "chunk", Some(json!({"progress": 0})))
        .await;
    session.send_binary(b"hello ").await;
    let reply = session.recv_envelope().await;
    assert_eq!(reply.data.as_ref().unwrap()["progress"], 6);

    session
        .send("upload", id, "chunk", Some(json!({"progress": 6})))
        .await;
    session.send_binary(b"world").await;
    let reply = session.recv_envelope().await;
    assert_eq!(reply.data.as_ref().unwrap()["progress"], 11);

    session
        .send(
            "upload",
            id,
            "complete_file",
            Some(json!({
                "digest": "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
            })),
        )
        .await;
    let reply = session.recv_envelope().await;
    assert!(reply.error.is_none(), "digest should verify: {:?}", reply.error);

    session.send("upload", id, "complete_session", None).await;
    let reply = session.recv_envelope().await;
    assert_eq!(reply.action, "complete_session");

    assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
}

#[tokio::test]
async fn fs_create_then_list_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let id = dir.path().to_str().unwrap();
    let mut session = spawn_local_session(dir.path(), IDLE);

    session
        .send("fs", id, "create", Some(json!({"name": "made.txt", "isDir": false})))
        .await;
    let reply = session.recv_until(|e| e.action == "create").await;
    assert!(reply.error.is_none());

    session
        .send("fs", id, "list", Some(json!({"showHidden": false})))
        .await;
    let reply = session.recv_until(|e| e.action == "list").await;
    let entries = reply.data.as_ref().unwrap()["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], "made.txt");
    assert_eq!(entries[0]["isDir"], false);
}

#[tokio::test]
async fn fs_copy_collision_appends_suffix() {
    let dir = tempfile::TempDir::new().unwrap();
    let src = dir.path().join("f");
    std::fs::write(&src, b"new").unwrap();
    let dest = dir.path().join("g");
    std::fs::create_dir(&dest).unwrap();
    std::fs::write(dest.join("f"), b"old").unwrap();

    let mut session = spawn_local_session(dir.path(), IDLE);
    session
        .send(
            "fs",
            src.to_str().unwrap(),
            "copy",
            Some(json!({"dest": dest.to_str().unwrap()})),
        )
        .await;
    let reply = session.recv_until(|e| e.action == "copy").await;
    assert!(reply.error.is_none());

    assert_eq!(std::fs::read(dest.join("f")).unwrap(), b"old");
    assert_eq!(std::fs::read(dest.join("f copy")).unwrap(), b"new");
}

#[tokio::test]
async fn peer_close_tears_down_and_discards_partial_upload() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("partial");
    let id = dest.to_str().unwrap();
    let mut session = spawn_local_session(dir.path(), IDLE);

    session
        .send("upload", id, "start_session", Some(json!({"policy": "overwrite"})))
        .await;
    session.recv_envelope().await;
    session
        .send("upload", id, "start_file", Some(json!({"path": id})))
        .await;
    session.recv_envelope().await;
    session
        .send("upload", id, "chunk", Some(json!({"progress": 0})))
        .await;
    session.send_binary(b"half-finish").await;
    session.recv_envelope().await;
    assert!(dest.exists());

    // Client vanishes mid-transfer.
    drop(session.client_tx);
    tokio::time::timeout(Duration::from_secs(5), session.server)
        .await
        .expect("session should tear down")
        .unwrap();

    // Teardown removes the partial destination (spawned, so poll briefly).
    for _ in 0..100 {
        if !dest.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!dest.exists(), "partial upload should be discarded");
}

#[tokio::test]
async fn upload_rename_policy_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("x.txt");
    std::fs::write(&dest, b"keep me").unwrap();
    let id = dest.to_str().unwrap();
    let mut session = spawn_local_session(dir.path(), IDLE);

    // No policy + existing path: confirmation requested, no session made.
    session.send("upload", id, "start_session", None).await;
    let reply = session.recv_envelope().await;
    assert_eq!(reply.data.as_ref().unwrap()["needConfirm"], true);

    // Retry with rename: content lands in x_1.txt.
    session
        .send("upload", id, "start_session", Some(json!({"policy": "rename"})))
        .await;
    let reply = session.recv_envelope().await;
    assert_eq!(reply.data.as_ref().unwrap()["needConfirm"], false);

    session
        .send("upload", id, "start_file", Some(json!({"path": id})))
        .await;
    session.recv_envelope().await;
    session
        .send("upload", id, "chunk", Some(json!({"progress": 0})))
        .await;
    session.send_binary(b"renamed").await;
    session.recv_envelope().await;
    session
        .send(
            "upload",
            id,
            "complete_file",
            Some(json!({
                "digest": hex::encode(sha2::Sha256::digest(b"renamed"))
            })),
        )
        .await;
    let reply = session.recv_envelope().await;
    assert!(reply.error.is_none());

    assert_eq!(std::fs::read(&dest).unwrap(), b"keep me");
    assert_eq!(std::fs::read(dir.path().join("x_1.txt")).unwrap(), b"renamed");
}
