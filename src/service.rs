use async_trait::async_trait;
use serde_json::Value;

use crate::transport::TransportError;

/// A named handler multiplexed onto one connection.
///
/// Services receive the decoded envelope fields for every text frame whose
/// `service` matches their name. Handlers that need binary frames claim them
/// through [`crate::dispatch::BinaryClaims`]. `cleanup` runs exactly once,
/// after the connection's read loop has exited, with the causing error; it
/// must not block on network I/O, since the peer is already gone.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, id: &str, action: &str, data: Option<Value>);

    async fn cleanup(&self, cause: &TransportError);
}
