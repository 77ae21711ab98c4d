//! Wire envelope for the multiplexed session protocol.
//!
//! Every text frame on the connection is one JSON [`Envelope`]. The
//! `service` field selects the handler, `id` is a caller-chosen correlation
//! token (doubling as the entity key: a shell's id, an upload session's
//! destination path), and `action` names the operation. `data` is an opaque
//! document whose schema is fixed per `(service, action)` and owned by the
//! service modules. Binary frames carry no envelope at all; they are routed
//! by claim (see `dispatch`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// A bare acknowledgement mirroring `service`, `id` and `action`.
    pub fn ack(service: &str, id: &str, action: &str) -> Self {
        Self {
            service: service.to_string(),
            id: id.to_string(),
            action: action.to_string(),
            data: None,
            error: None,
        }
    }

    /// An acknowledgement carrying a response document.
    pub fn with_data(service: &str, id: &str, action: &str, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ack(service, id, action)
        }
    }

    /// An error reply mirroring `service`, `id` and `action`.
    pub fn error(service: &str, id: &str, action: &str, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::ack(service, id, action)
        }
    }
}
