//! Connection-level frame I/O.
//!
//! The WebSocket is split once at upgrade time: the read half becomes a
//! [`MessageSource`] owned by the dispatcher's read loop, the write half a
//! [`MessageSink`] shared by every service through an [`Outbox`]. Both sides
//! are traits so the whole session stack can be driven by in-memory
//! transports in tests.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::protocol::Envelope;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed by peer")]
    ClosedByPeer,

    #[error("connection closed")]
    Closed,

    #[error("websocket i/o error: {0}")]
    Io(#[from] axum::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One inbound frame: a JSON text envelope or opaque binary bytes.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Read side of a connection. Single-threaded: only the dispatcher's read
/// loop holds it.
#[async_trait]
pub trait MessageSource: Send {
    /// Next text or binary frame. `ClosedByPeer` on clean close or EOF.
    async fn next_frame(&mut self) -> Result<Frame, TransportError>;
}

/// Write side of a connection. Always accessed through [`Outbox`], which
/// serializes concurrent callers.
#[async_trait]
pub trait MessageSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError>;
    /// Best-effort close notification to the peer.
    async fn close(&mut self);
}

pub struct WsSource(pub SplitStream<WebSocket>);

#[async_trait]
impl MessageSource for WsSource {
    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            match self.0.next().await {
                None => return Err(TransportError::ClosedByPeer),
                Some(Ok(Message::Close(_))) => return Err(TransportError::ClosedByPeer),
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text)),
                Some(Ok(Message::Binary(data))) => return Ok(Frame::Binary(Bytes::from(data))),
                // Ping/Pong are handled by axum.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Io(e)),
            }
        }
    }
}

pub struct WsSink(pub SplitSink<WebSocket, Message>);

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0.send(Message::Text(text)).await.map_err(Into::into)
    }

    async fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.0
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(Into::into)
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.flush().await;
    }
}

/// Cheap-clone handle for emitting frames on a connection.
///
/// All writes go through one async lock, so frames from concurrent services
/// never interleave. `close()` cancels the connection token; the read loop
/// observes it and tears the session down.
#[derive(Clone)]
pub struct Outbox {
    sink: Arc<tokio::sync::Mutex<Box<dyn MessageSink>>>,
    cancel: CancellationToken,
}

impl Outbox {
    pub fn new(sink: Box<dyn MessageSink>, cancel: CancellationToken) -> Self {
        Self {
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            cancel,
        }
    }

    pub async fn send_json(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = serde_json::to_string(envelope)?;
        let mut sink = self.sink.lock().await;
        let result = sink.send_text(text).await;
        if let Err(e) = &result {
            tracing::warn!(service = %envelope.service, "failed to write frame: {e}");
        }
        result
    }

    pub async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        let result = sink.send_binary(data).await;
        if let Err(e) = &result {
            tracing::warn!("failed to write binary frame: {e}");
        }
        result
    }

    /// Request the connection be closed. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Notify the peer and release the sink. Called once during teardown.
    pub(crate) async fn shutdown_sink(&self) {
        self.sink.lock().await.close().await;
    }
}
