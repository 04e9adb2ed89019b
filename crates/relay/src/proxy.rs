//! `Peer` adapter over a running relay, so the connection manager can
//! treat an extension-backed peer exactly like a direct connection.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;

use webcell_channel::{Peer, PeerEvent};
use webcell_core::Result;

use crate::server::RelayServer;

pub struct RelayPeer {
    server: RelayServer,
}

impl RelayPeer {
    pub fn new(server: RelayServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Peer for RelayPeer {
    async fn send_request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        self.server.send_request(method, params, timeout).await
    }

    async fn close(&self) {
        self.server.close_peer().await;
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.server.subscribe_events()
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<String> {
        self.server.subscribe_disconnect()
    }

    fn is_connected(&self) -> bool {
        self.server.is_connected()
    }
}
