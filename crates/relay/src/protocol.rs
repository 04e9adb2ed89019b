//! Wire-level message shapes for the relay WebSocket protocol.
//!
//! Requests are `{"id":n,"method":s,"params":v}` and replies
//! `{"id":n,"result":v}` / `{"id":n,"error":{"message":s}}`; those are
//! handled generically by the correlated channel. The shapes here cover
//! everything else the extension peer sends or receives.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Close code for a missing or mismatched auth token (RFC 6455 policy
/// violation).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close code for a connection attempt while a peer is already active.
pub const CLOSE_ALREADY_CONNECTED: u16 = 4409;

/// Application-level keep-alive frame. No reply expected.
pub fn ping_frame() -> String {
    r#"{"type":"ping"}"#.to_string()
}

/// Non-reply messages from the extension peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    /// Readiness handshake; must be the peer's first message.
    #[serde(rename = "ready")]
    Ready {
        #[serde(rename = "tabId")]
        tab_id: i64,
    },
    /// A remote-protocol event the extension forwards verbatim.
    #[serde(rename = "forwardCDPEvent")]
    ForwardCdpEvent {
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// The extension lost its debugger attachment to the tab.
    #[serde(rename = "detached")]
    Detached {
        #[serde(rename = "tabId")]
        tab_id: i64,
        reason: String,
    },
}

/// Payload served by `GET /relay-info`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayInfo {
    pub ws_url: String,
    pub tab_url: Option<String>,
    pub tab_id: Option<i64>,
    pub new_tab: bool,
}
