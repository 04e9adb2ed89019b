//! Relay between the controller and a browser-extension peer.
//!
//! A single authenticated WebSocket peer connects to the relay; commands
//! flow out through a correlated channel and replies/events flow back. A
//! short-lived discovery HTTP endpoint lets an unconfigured peer learn the
//! relay's address.

pub mod discovery;
pub mod protocol;
pub mod proxy;
pub mod server;

pub use discovery::DiscoveryHints;
pub use protocol::{PeerMessage, RelayInfo, CLOSE_ALREADY_CONNECTED, CLOSE_POLICY_VIOLATION};
pub use proxy::RelayPeer;
pub use server::RelayServer;
