//! Connection lifecycle management for a direct controller-to-peer link.
//!
//! The manager detects disconnection (by event or by classifying errors
//! from failed operations) and drives one shared, bounded reconnection
//! sequence regardless of how many callers hit the failure concurrently.

pub mod classify;
pub mod manager;

pub use classify::is_connection_error;
pub use manager::{ConnectionManager, ConnectionState, JitterSource, PeerFactory, ReconnectHook};
