use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;

use webcell_core::Result;

/// A typed, unsolicited notification forwarded by a peer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A forwarded remote-protocol event.
    Cdp { method: String, params: Value },
    /// The peer detached from the tab it was driving.
    Detached { tab_id: i64, reason: String },
}

/// The capability set every managed transport implements.
///
/// Both the direct WebSocket connection and the relay-backed extension
/// proxy satisfy this; the connection manager only ever talks to a
/// `dyn Peer`.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Send a correlated request and await its reply.
    async fn send_request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value>;

    /// Best-effort close of the underlying transport. Never fails.
    async fn close(&self);

    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent>;

    /// Fires once with a reason when the transport drops unexpectedly.
    fn subscribe_disconnect(&self) -> broadcast::Receiver<String>;

    fn is_connected(&self) -> bool;
}
