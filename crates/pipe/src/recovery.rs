//! Single-flight recovery gate for the host-process pipe.
//!
//! "Recovery" here is not a reconnect: the pipe has no persistent
//! connection. It means invoking one externally owned remediation action
//! (typically asking a supervisor to relaunch the host) and waiting for
//! the host to answer probes again. Concurrent callers share one
//! recovery cycle; the handler runs exactly once per cycle.

use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use webcell_core::{Error, Result};

use crate::client::PipeClient;

pub type RecoveryHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

enum Role {
    Leader(broadcast::Sender<()>),
    Waiter(broadcast::Receiver<()>),
}

pub struct RecoveryCoordinator {
    client: PipeClient,
    handler: Option<RecoveryHandler>,
    probe_timeout: Duration,
    probe_delays: Vec<Duration>,
    in_flight: Mutex<Option<broadcast::Sender<()>>>,
}

impl RecoveryCoordinator {
    pub fn new(client: PipeClient, handler: Option<RecoveryHandler>) -> Self {
        Self {
            client,
            handler,
            probe_timeout: Duration::from_secs(1),
            probe_delays: vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(6),
            ],
            in_flight: Mutex::new(None),
        }
    }

    /// Override probe timing (tests and impatient embedders).
    pub fn with_probe_timing(mut self, probe_timeout: Duration, probe_delays: Vec<Duration>) -> Self {
        self.probe_timeout = probe_timeout;
        self.probe_delays = probe_delays;
        self
    }

    async fn probe(&self) -> bool {
        self.client
            .call_with_timeout("ping", json!({}), self.probe_timeout)
            .await
            .is_ok()
    }

    /// Make sure the host process answers, recovering it if necessary.
    ///
    /// At most one recovery cycle runs at a time; a caller that finds one
    /// already in flight waits for it and re-probes once. It does not
    /// start another cycle after that, to avoid unbounded chains.
    pub async fn ensure_available(&self) -> Result<()> {
        if self.probe().await {
            return Ok(());
        }

        // Attach to the in-flight cycle or claim the slot. The check and
        // the set happen under one lock acquisition with no intervening
        // await.
        let role = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.as_ref() {
                Some(tx) => Role::Waiter(tx.subscribe()),
                None => {
                    if self.handler.is_none() {
                        return Err(Error::Config(
                            "host process is unreachable and no recovery handler is registered"
                                .to_string(),
                        ));
                    }
                    let (tx, _) = broadcast::channel(1);
                    *in_flight = Some(tx.clone());
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Waiter(mut rx) => {
                debug!("recovery already in flight, waiting for it");
                let _ = rx.recv().await;
                if self.probe().await {
                    Ok(())
                } else {
                    Err(Error::Exhausted(
                        "host process still unavailable after waiting for a concurrent recovery; restart it manually".to_string(),
                    ))
                }
            }
            Role::Leader(tx) => {
                let outcome = self.run_recovery().await;
                // Cleared unconditionally, success or failure.
                *self.in_flight.lock().await = None;
                let _ = tx.send(());
                outcome
            }
        }
    }

    async fn run_recovery(&self) -> Result<()> {
        let Some(handler) = self.handler.clone() else {
            return Err(Error::Config(
                "host process is unreachable and no recovery handler is registered".to_string(),
            ));
        };

        info!("host process unreachable, invoking recovery handler");
        handler().await.map_err(|e| {
            Error::Exhausted(format!(
                "recovery handler failed: {}; restart the host process manually",
                e
            ))
        })?;

        for (attempt, delay) in self.probe_delays.iter().enumerate() {
            tokio::time::sleep(*delay).await;
            if self.probe().await {
                info!("host process is back after recovery");
                return Ok(());
            }
            debug!(attempt = attempt + 1, "host still unreachable after recovery");
        }

        Err(Error::Exhausted(format!(
            "host process did not come back after recovery ({} probes); restart it manually",
            self.probe_delays.len()
        )))
    }
}
