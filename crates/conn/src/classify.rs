//! Connection-loss error classification.
//!
//! The remote protocol surfaces failures from several code paths with
//! different shapes, so classification is layered: typed error variants
//! first, then known message substrings, then the
//! `Protocol error (Domain.method)` form emitted by remotes that wrap a
//! failing protocol method instead of raising a typed error.

use webcell_core::Error;

const CONNECTION_LOSS_MARKERS: &[&str] = &[
    "connection closed",
    "session closed",
    "target closed",
    "websocket is not open",
];

/// Whether an error indicates the connection is gone (reconnect and retry)
/// rather than a failure of the operation itself (propagate unchanged).
pub fn is_connection_error(err: &Error) -> bool {
    match err {
        Error::Timeout(_)
        | Error::NotConnected(_)
        | Error::ChannelClosed(_)
        | Error::Transport(_) => true,
        other => {
            let msg = other.to_string().to_lowercase();
            CONNECTION_LOSS_MARKERS.iter().any(|m| msg.contains(m))
                || msg.contains("protocol error (")
        }
    }
}
