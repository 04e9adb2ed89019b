//! Host-process RPC over a local pipe, plus the recovery gate that
//! restarts a dead host exactly once per outage regardless of how many
//! callers notice it concurrently.

pub mod client;
pub mod recovery;

pub use client::PipeClient;
pub use recovery::{RecoveryCoordinator, RecoveryHandler};
