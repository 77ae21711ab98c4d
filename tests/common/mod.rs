//! In-memory transport harness: drives a full `SessionServer` (real
//! dispatcher, real services, local backends) through channel-backed frames,
//! no socket required.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use webshell::fs::{FsService, LocalFs};
use webshell::heartbeat::HeartbeatService;
use webshell::protocol::Envelope;
use webshell::session::SessionServer;
use webshell::shell::{LocalShellBackend, ShellService};
use webshell::transport::{Frame, MessageSink, MessageSource, Outbox, TransportError};
use webshell::upload::{LocalUploadBackend, UploadService};

pub struct ChannelSource(pub mpsc::Receiver<Frame>);

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        self.0.recv().await.ok_or(TransportError::ClosedByPeer)
    }
}

pub struct ChannelSink(pub mpsc::Sender<Frame>);

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Frame::Text(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.0
            .send(Frame::Binary(data))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {}
}

/// A client's view of one local-backend session.
pub struct LocalSession {
    pub client_tx: mpsc::Sender<Frame>,
    pub client_rx: mpsc::Receiver<Frame>,
    pub server: tokio::task::JoinHandle<()>,
}

pub fn spawn_local_session(root: &Path, idle_timeout: Duration) -> LocalSession {
    let (client_tx, server_rx) = mpsc::channel(32);
    let (server_tx, client_rx) = mpsc::channel(32);

    let outbox = Outbox::new(Box::new(ChannelSink(server_tx)), CancellationToken::new());
    let mut server = SessionServer::new(outbox.clone(), idle_timeout);
    let claims = server.binary_claims();

    server.register(Arc::new(ShellService::new(
        outbox.clone(),
        Box::new(LocalShellBackend::new(root.to_path_buf())),
    )));
    server.register(Arc::new(FsService::new(
        outbox.clone(),
        Arc::new(LocalFs::new(root.to_path_buf())),
    )));
    server.register(Arc::new(UploadService::new(
        outbox.clone(),
        Arc::new(LocalUploadBackend),
        claims,
    )));
    server.register_passive(Arc::new(HeartbeatService::new(outbox.clone())));

    let server = tokio::spawn(server.serve(Box::new(ChannelSource(server_rx))));

    LocalSession {
        client_tx,
        client_rx,
        server,
    }
}

impl LocalSession {
    pub async fn send(&self, service: &str, id: &str, action: &str, data: Option<Value>) {
        let envelope = Envelope {
            service: service.to_string(),
            id: id.to_string(),
            action: action.to_string(),
            data,
            error: None,
        };
        self.client_tx
            .send(Frame::Text(serde_json::to_string(&envelope).unwrap()))
            .await
            .expect("server should still be reading");
    }

    pub async fn send_binary(&self, data: &'static [u8]) {
        self.client_tx
            .send(Frame::Binary(Bytes::from_static(data)))
            .await
            .expect("server should still be reading");
    }

    /// Next text frame as an envelope; panics after five seconds.
    pub async fn recv_envelope(&mut self) -> Envelope {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.client_rx.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("server closed the connection");
            match frame {
                Frame::Text(text) => return serde_json::from_str(&text).unwrap(),
                Frame::Binary(_) => continue,
            }
        }
    }

    /// Receive envelopes until one matches, returning it. Useful when shell
    /// output frames interleave with the reply being waited on.
    pub async fn recv_until<F: Fn(&Envelope) -> bool>(&mut self, pred: F) -> Envelope {
        loop {
            let envelope = self.recv_envelope().await;
            if pred(&envelope) {
                return envelope;
            }
        }
    }
}
