//! Frame routing between the connection read loop and services.
//!
//! Text frames carry their own routing key (the envelope's `service` field);
//! binary frames do not. A service that expects a binary frame posts a
//! one-shot claim; the router pairs the oldest posted claim with the next
//! binary frame. Claims are strict FIFO across services and each claim
//! consumes exactly one frame, so interleaved binary reception from several
//! services stays unambiguous.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::protocol::Envelope;
use crate::transport::{Frame, MessageSource, TransportError};

/// Channel depth between the read loop and the consumers. Matches the
/// buffering of the original wire clients; overruns backpressure the socket.
pub(crate) const CHANNEL_CAPACITY: usize = 10;

/// Handle for claiming binary frames. Cheap to clone; held by services.
#[derive(Clone)]
pub struct BinaryClaims {
    tx: mpsc::UnboundedSender<oneshot::Sender<Bytes>>,
}

impl BinaryClaims {
    /// Post a claim for the next unclaimed binary frame and return the slot
    /// it will be delivered on. The claim's position in the FIFO is fixed at
    /// post time, so a caller can order its claim relative to other traffic
    /// and await the bytes later.
    ///
    /// Returns `None` once the connection is torn down.
    pub fn post(&self) -> Option<oneshot::Receiver<Bytes>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(tx).ok()?;
        Some(rx)
    }

    /// Claim the next unclaimed binary frame.
    pub async fn claim(&self) -> Option<Bytes> {
        self.post()?.await.ok()
    }
}

pub(crate) fn claim_queue() -> (
    BinaryClaims,
    mpsc::UnboundedReceiver<oneshot::Sender<Bytes>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BinaryClaims { tx }, rx)
}

/// Read frames until the peer closes, an I/O error occurs, or the
/// connection token is cancelled. Returns the cause for service cleanup.
///
/// Malformed text frames are logged and dropped without a reply.
pub(crate) async fn read_loop(
    mut source: Box<dyn MessageSource>,
    text_tx: mpsc::Sender<Envelope>,
    binary_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> TransportError {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return TransportError::Closed,
            frame = source.next_frame() => frame,
        };
        match frame {
            Err(cause) => return cause,
            Ok(Frame::Binary(data)) => {
                if binary_tx.send(data).await.is_err() {
                    return TransportError::Closed;
                }
            }
            Ok(Frame::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => {
                    if text_tx.send(envelope).await.is_err() {
                        return TransportError::Closed;
                    }
                }
                Err(e) => tracing::warn!("error decoding envelope: {e}"),
            },
        }
    }
}

/// Pair claims with binary frames, oldest claim first.
pub(crate) async fn route_binary(
    mut claims_rx: mpsc::UnboundedReceiver<oneshot::Sender<Bytes>>,
    mut binary_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let claim = tokio::select! {
            _ = cancel.cancelled() => break,
            claim = claims_rx.recv() => match claim {
                Some(claim) => claim,
                None => break,
            },
        };
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            data = binary_rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };
        // A dropped claimant just loses its frame, same as a vanished peer.
        let _ = claim.send(data);
    }
}
