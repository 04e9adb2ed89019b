//! Request/response correlation over unreliable duplex transports.
//!
//! `CorrelatedChannel` turns a raw message stream into a concurrent
//! request/response abstraction; `Peer` is the capability set both the
//! direct WebSocket transport and the relay-backed transport implement.

pub mod correlate;
pub mod peer;
pub mod ws;

pub use correlate::{ChannelEvent, CorrelatedChannel};
pub use peer::{Peer, PeerEvent};
pub use ws::WsPeer;
