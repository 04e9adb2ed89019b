//! Direct WebSocket peer adapter.
//!
//! Connects straight to a browser debugging endpoint and runs the
//! correlated channel over it: a writer task owns the sink, a reader task
//! feeds inbound frames to the channel, and a disconnect broadcast fires
//! when the stream ends.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use webcell_core::{Error, Result};

use crate::correlate::CorrelatedChannel;
use crate::peer::{Peer, PeerEvent};

pub struct WsPeer {
    channel: CorrelatedChannel,
    events: broadcast::Sender<PeerEvent>,
    disconnects: broadcast::Sender<String>,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
    forward_handle: tokio::task::JoinHandle<()>,
}

impl WsPeer {
    /// Connect to a WebSocket endpoint and start the channel tasks.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to {}: {}", ws_url, e)))?;

        let (mut ws_sink, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        let channel = CorrelatedChannel::new(out_tx);
        let (events, _) = broadcast::channel(64);
        let (disconnects, _) = broadcast::channel(4);
        let connected = Arc::new(AtomicBool::new(true));

        // Writer task: owns the sink, forwards outbound frames.
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!(error = %e, "websocket write error");
                    break;
                }
            }
        });

        // Reader task: feeds inbound frames to the channel; on stream end,
        // rejects all pending requests and fires the disconnect broadcast.
        let reader_handle = tokio::spawn({
            let channel = channel.clone();
            let connected = connected.clone();
            let disconnects = disconnects.clone();
            async move {
                let reason = loop {
                    match ws_read.next().await {
                        Some(Ok(Message::Text(text))) => channel.handle_message(&text).await,
                        Some(Ok(Message::Close(_))) => {
                            debug!("websocket closed by remote");
                            break "connection closed by remote".to_string();
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read error");
                            break format!("websocket read error: {}", e);
                        }
                        None => break "connection closed".to_string(),
                        _ => {}
                    }
                };
                connected.store(false, Ordering::SeqCst);
                channel.close(&reason).await;
                let _ = disconnects.send(reason);
            }
        });

        // Channel events become typed peer events.
        let forward_handle = tokio::spawn({
            let mut rx = channel.subscribe_events();
            let events = events.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(ev) => {
                            let _ = events.send(PeerEvent::Cdp {
                                method: ev.method,
                                params: ev.params,
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(Self {
            channel,
            events,
            disconnects,
            connected,
            reader_handle,
            writer_handle,
            forward_handle,
        })
    }
}

#[async_trait]
impl Peer for WsPeer {
    async fn send_request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::NotConnected(format!(
                "cannot send '{}': websocket is not open",
                method
            )));
        }
        self.channel.send(method, params, timeout).await
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.channel.close("closed by client").await;
        self.reader_handle.abort();
        self.writer_handle.abort();
        self.forward_handle.abort();
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<String> {
        self.disconnects.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WsPeer {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
        self.forward_handle.abort();
    }
}
