use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::Envelope;
use crate::service::Service;
use crate::transport::{Outbox, TransportError};

/// Keep-alive echo. Registered passively, so heartbeats alone cannot keep a
/// dead session open.
pub struct HeartbeatService {
    outbox: Outbox,
}

impl HeartbeatService {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }
}

#[async_trait]
impl Service for HeartbeatService {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn handle(&self, id: &str, action: &str, _data: Option<Value>) {
        let _ = self
            .outbox
            .send_json(&Envelope::ack(self.name(), id, action))
            .await;
    }

    async fn cleanup(&self, _cause: &TransportError) {}
}
