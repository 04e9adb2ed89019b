//! Relay WebSocket server: one authenticated extension peer at a time.

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use webcell_channel::{CorrelatedChannel, PeerEvent};
use webcell_core::{Error, RelayConfig, Result};

use crate::protocol::{ping_frame, PeerMessage, CLOSE_ALREADY_CONNECTED, CLOSE_POLICY_VIOLATION};

/// The single peer slot. A second connection attempt is rejected while
/// this is non-empty, never queued and never displacing the occupant.
enum PeerSlot {
    Empty,
    /// Connection admitted, ready handshake not yet received.
    Attached { close: CancellationToken },
    Active {
        channel: CorrelatedChannel,
        tab_id: i64,
        close: CancellationToken,
    },
}

pub(crate) struct RelayInner {
    token: String,
    requested_port: u16,
    pub(crate) discovery_ports: Vec<u16>,
    keepalive: Duration,
    port: AtomicU16,
    connected: AtomicBool,
    slot: Mutex<PeerSlot>,
    events: broadcast::Sender<PeerEvent>,
    disconnects: broadcast::Sender<String>,
    pub(crate) shutdown: CancellationToken,
}

impl RelayInner {
    pub(crate) fn ws_url(&self) -> String {
        format!(
            "ws://127.0.0.1:{}/?token={}",
            self.port.load(Ordering::SeqCst),
            self.token
        )
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let channel = {
            let slot = self.slot.lock().await;
            match &*slot {
                PeerSlot::Active { channel, .. } if !channel.is_closed() => channel.clone(),
                _ => {
                    return Err(Error::NotConnected(
                        "no extension peer is connected to the relay".to_string(),
                    ))
                }
            }
        };
        channel.send(method, params, timeout).await
    }
}

fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<RelayInner>,
}

impl RelayServer {
    /// Create a relay with a fresh per-instance auth token.
    pub fn new(config: &RelayConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        let (disconnects, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(RelayInner {
                token: Uuid::new_v4().simple().to_string(),
                requested_port: config.port,
                discovery_ports: config.discovery_ports.clone(),
                keepalive: Duration::from_secs(config.keepalive_secs.max(1)),
                port: AtomicU16::new(0),
                connected: AtomicBool::new(false),
                slot: Mutex::new(PeerSlot::Empty),
                events,
                disconnects,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Bind the loopback listener and return the bound port.
    pub async fn start(&self) -> Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", self.inner.requested_port))
            .await
            .map_err(|e| Error::Transport(format!("failed to bind relay listener: {}", e)))?;
        let port = listener.local_addr()?.port();
        self.inner.port.store(port, Ordering::SeqCst);

        let app = Router::new()
            .route("/", get(handle_upgrade))
            .with_state(self.inner.clone());
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!(error = %e, "relay listener exited with error");
            }
        });

        info!(port, "relay listening on 127.0.0.1");
        Ok(port)
    }

    pub fn token(&self) -> &str {
        &self.inner.token
    }

    pub fn port(&self) -> u16 {
        self.inner.port.load(Ordering::SeqCst)
    }

    /// Connect URL for the extension peer, auth token included.
    pub fn ws_url(&self) -> String {
        self.inner.ws_url()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub async fn active_tab_id(&self) -> Option<i64> {
        match &*self.inner.slot.lock().await {
            PeerSlot::Active { tab_id, .. } => Some(*tab_id),
            _ => None,
        }
    }

    /// Send a command to the active peer. Fails fast when none is.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.inner.send_request(method, params, timeout).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<String> {
        self.inner.disconnects.subscribe()
    }

    /// Start the discovery HTTP server on the first free candidate port.
    /// Returns `None` when the whole range is taken.
    pub async fn start_discovery(
        &self,
        hints: crate::discovery::DiscoveryHints,
    ) -> Result<Option<u16>> {
        let candidates = self.inner.discovery_ports.clone();
        crate::discovery::start(self.inner.clone(), hints, &candidates).await
    }

    /// Drop the current peer connection (if any) without stopping the
    /// listener.
    pub async fn close_peer(&self) {
        let slot = self.inner.slot.lock().await;
        match &*slot {
            PeerSlot::Attached { close } | PeerSlot::Active { close, .. } => close.cancel(),
            PeerSlot::Empty => {}
        }
    }

    /// Stop everything: peer socket, discovery server, listener. Idempotent.
    pub async fn stop(&self) {
        self.close_peer().await;
        self.inner.shutdown.cancel();
    }
}

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(inner): State<Arc<RelayInner>>,
) -> impl IntoResponse {
    // Validate inside the WS handler so the peer sees a proper close code
    // instead of a failed HTTP upgrade.
    let token_ok = params
        .get("token")
        .map(|t| secure_eq(t, &inner.token))
        .unwrap_or(false);

    ws.on_upgrade(move |socket| async move {
        if !token_ok {
            warn!("rejecting relay connection: missing or invalid token");
            close_with(socket, CLOSE_POLICY_VIOLATION, "invalid token").await;
            return;
        }
        run_peer(inner, socket).await;
    })
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: std::borrow::Cow::Borrowed(reason),
        })))
        .await;
}

async fn run_peer(inner: Arc<RelayInner>, socket: WebSocket) {
    let conn = CancellationToken::new();
    {
        let mut slot = inner.slot.lock().await;
        if !matches!(*slot, PeerSlot::Empty) {
            drop(slot);
            warn!("rejecting relay connection: a peer is already connected");
            close_with(
                socket,
                CLOSE_ALREADY_CONNECTED,
                "another peer is already connected",
            )
            .await;
            return;
        }
        *slot = PeerSlot::Attached {
            close: conn.clone(),
        };
    }

    let (mut sink, mut stream) = socket.split();

    // Readiness handshake: the first application-level message must be
    // `ready` with the peer's tab id.
    let first = tokio::select! {
        _ = conn.cancelled() => None,
        msg = stream.next() => msg,
    };
    let tab_id = match first {
        Some(Ok(WsMessage::Text(text))) => {
            match serde_json::from_str::<PeerMessage>(&text) {
                Ok(PeerMessage::Ready { tab_id }) => tab_id,
                _ => {
                    warn!("peer did not open with a ready handshake, closing");
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CLOSE_POLICY_VIOLATION,
                            reason: std::borrow::Cow::Borrowed("expected ready handshake"),
                        })))
                        .await;
                    *inner.slot.lock().await = PeerSlot::Empty;
                    return;
                }
            }
        }
        _ => {
            *inner.slot.lock().await = PeerSlot::Empty;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let channel = CorrelatedChannel::new(out_tx);
    {
        let mut slot = inner.slot.lock().await;
        *slot = PeerSlot::Active {
            channel: channel.clone(),
            tab_id,
            close: conn.clone(),
        };
    }
    inner.connected.store(true, Ordering::SeqCst);
    info!(tab_id, "relay peer ready");

    // The peer may be a background process whose host reclaims it when
    // idle; periodic traffic prevents that.
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + inner.keepalive,
        inner.keepalive,
    );

    let reason = loop {
        tokio::select! {
            _ = conn.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break "closed by relay".to_string();
            }
            maybe = out_rx.recv() => match maybe {
                Some(frame) => {
                    if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                        break format!("write error: {}", e);
                    }
                }
                None => break "writer channel dropped".to_string(),
            },
            _ = keepalive.tick() => {
                if sink.send(WsMessage::Text(ping_frame())).await.is_err() {
                    break "keep-alive write failed".to_string();
                }
            }
            maybe = stream.next() => match maybe {
                Some(Ok(WsMessage::Text(text))) => route_inbound(&inner, &channel, &text).await,
                Some(Ok(WsMessage::Close(_))) | None => break "peer disconnected".to_string(),
                Some(Err(e)) => break format!("read error: {}", e),
                Some(Ok(_)) => {}
            },
        }
    };

    inner.connected.store(false, Ordering::SeqCst);
    channel.close(&reason).await;
    *inner.slot.lock().await = PeerSlot::Empty;
    let _ = inner.disconnects.send(reason.clone());
    info!(tab_id, reason = %reason, "relay peer disconnected");
}

/// Demultiplex one inbound frame: replies go to the correlated channel,
/// forwarded notifications become typed events, anything else is dropped.
async fn route_inbound(inner: &Arc<RelayInner>, channel: &CorrelatedChannel, text: &str) {
    let val: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dropping malformed peer message");
            return;
        }
    };

    if val.get("id").is_some() {
        channel.handle_message(text).await;
        return;
    }

    match serde_json::from_value::<PeerMessage>(val) {
        Ok(PeerMessage::ForwardCdpEvent { method, params }) => {
            debug!(method = %method, "forwarding peer event");
            let _ = inner.events.send(PeerEvent::Cdp { method, params });
        }
        Ok(PeerMessage::Detached { tab_id, reason }) => {
            let _ = inner.events.send(PeerEvent::Detached { tab_id, reason });
        }
        Ok(PeerMessage::Ready { .. }) => warn!("duplicate ready handshake, ignoring"),
        Err(e) => warn!(error = %e, "dropping unrecognized peer message"),
    }
}
