//! Correlated request channel: id assignment, pending-request tracking,
//! per-request timeouts, and event republishing over one message stream.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use webcell_core::{Error, Result};

/// An unsolicited, event-shaped message received on the channel.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub method: String,
    pub params: Value,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// Request/response correlation over a raw message stream.
///
/// The transport owns the read loop and feeds every inbound frame to
/// [`handle_message`](Self::handle_message); outbound frames are written
/// through the `mpsc` sender handed to [`new`](Self::new). Ids are a
/// monotonic counter, so they cannot collide for the lifetime of one
/// channel. Every pending request settles exactly once: matching reply,
/// timeout, or channel close, whichever comes first.
#[derive(Clone)]
pub struct CorrelatedChannel {
    outbound: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

impl CorrelatedChannel {
    pub fn new(outbound: mpsc::Sender<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            events,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send `{id, method, params}` and wait for the matching reply.
    pub async fn send(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::NotConnected(format!(
                "cannot send '{}': channel is closed",
                method
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        if self.outbound.send(msg.to_string()).await.is_err() {
            let mut pending = self.pending.lock().await;
            pending.remove(&id);
            return Err(Error::Transport(format!(
                "failed to write request '{}': transport writer is gone",
                method
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => Err(Error::ChannelClosed(format!(
                "channel closed while awaiting reply to '{}'",
                method
            ))),
            Err(_) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&id);
                Err(Error::Timeout(format!(
                    "request '{}' timed out after {}ms",
                    method,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Route one inbound frame: reply, event, or garbage.
    ///
    /// Malformed payloads are logged and dropped; they must never tear
    /// down the transport read loop.
    pub async fn handle_message(&self, raw: &str) {
        let val: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping malformed channel message");
                return;
            }
        };

        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
            let tx = {
                let mut pending = self.pending.lock().await;
                pending.remove(&id)
            };
            let Some(tx) = tx else {
                debug!(id, "reply with no pending request, dropping");
                return;
            };
            let _ = tx.send(Self::settle(&val));
        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
            let params = val.get("params").cloned().unwrap_or(Value::Null);
            let _ = self.events.send(ChannelEvent {
                method: method.to_string(),
                params,
            });
        } else {
            warn!("dropping message with neither id nor method");
        }
    }

    /// Turn a reply payload into the pending request's settlement.
    ///
    /// A structured remote error keeps its code/message; an error field
    /// that is not `{code?, message}`-shaped is a parse error, distinct
    /// from a remote application error.
    fn settle(val: &Value) -> Result<Value> {
        match val.get("error") {
            None => Ok(val.get("result").cloned().unwrap_or(Value::Null)),
            Some(err) => {
                if let Some(message) = err.get("message").and_then(|m| m.as_str()) {
                    Err(Error::Remote {
                        code: err.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                        message: message.to_string(),
                    })
                } else {
                    Err(Error::Protocol(format!(
                        "unstructured error payload: {}",
                        err
                    )))
                }
            }
        }
    }

    /// Reject every outstanding request and refuse further sends.
    pub async fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(Error::ChannelClosed(reason.to_string())));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
