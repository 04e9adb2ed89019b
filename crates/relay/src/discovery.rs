//! Discovery HTTP endpoint: lets an unconfigured extension peer learn how
//! to reach the relay.
//!
//! Binds the first free port from a fixed candidate list so the extension
//! only has to probe a handful of well-known ports. CORS is fully open
//! because the caller is an extension page, not a same-origin client; the
//! server itself only ever binds loopback.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use webcell_core::Result;

use crate::protocol::RelayInfo;
use crate::server::RelayInner;

/// Hints served to a self-discovering peer: which tab to drive, or
/// whether to open a fresh one.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryHints {
    pub tab_url: Option<String>,
    pub tab_id: Option<i64>,
    pub new_tab: bool,
}

#[derive(Clone)]
struct DiscoveryState {
    inner: Arc<RelayInner>,
    hints: DiscoveryHints,
}

pub(crate) async fn start(
    inner: Arc<RelayInner>,
    hints: DiscoveryHints,
    candidates: &[u16],
) -> Result<Option<u16>> {
    let mut bound = None;
    for &port in candidates {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                bound = Some(listener);
                break;
            }
            Err(e) => debug!(port, error = %e, "discovery port unavailable, trying next"),
        }
    }
    let Some(listener) = bound else {
        warn!(?candidates, "no discovery port available");
        return Ok(None);
    };
    let port = listener.local_addr()?.port();

    let app = Router::new()
        .route("/relay-info", get(handle_relay_info))
        .route("/reload-extension", post(handle_reload_extension))
        .layer(CorsLayer::permissive())
        .with_state(DiscoveryState {
            inner: inner.clone(),
            hints,
        });

    let shutdown = inner.shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            warn!(error = %e, "discovery server exited with error");
        }
    });

    info!(port, "discovery server listening on 127.0.0.1");
    Ok(Some(port))
}

async fn handle_relay_info(State(state): State<DiscoveryState>) -> Json<RelayInfo> {
    Json(RelayInfo {
        ws_url: state.inner.ws_url(),
        tab_url: state.hints.tab_url.clone(),
        tab_id: state.hints.tab_id,
        new_tab: state.hints.new_tab,
    })
}

async fn handle_reload_extension(State(state): State<DiscoveryState>) -> Response {
    if !state.inner.is_connected() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "no extension peer connected"})),
        )
            .into_response();
    }

    // Telling the peer to reload itself drops the connection as a side
    // effect; that is the expected outcome, not a failure.
    match state
        .inner
        .send_request("reloadExtension", json!({}), Duration::from_secs(3))
        .await
    {
        Ok(_) => Json(json!({"success": true})).into_response(),
        Err(e) => Json(json!({
            "success": true,
            "note": format!("peer connection dropped during reload: {}", e),
        }))
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::RelayServer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use webcell_core::RelayConfig;

    async fn http_request(port: u16, method: &str, path: &str) -> (u16, String) {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let req = format!(
            "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            method, path, port
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf).to_string();
        let status = text
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let body = text
            .split("\r\n\r\n")
            .nth(1)
            .unwrap_or("")
            .trim()
            .to_string();
        (status, body)
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            port: 0,
            // Port 0 lets the OS pick, so the test cannot collide.
            discovery_ports: vec![0],
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_relay_info_served_with_open_cors() {
        let server = RelayServer::new(&test_config());
        server.start().await.unwrap();
        let port = server
            .start_discovery(DiscoveryHints {
                tab_url: Some("https://example.com".to_string()),
                tab_id: Some(3),
                new_tab: false,
            })
            .await
            .unwrap()
            .expect("discovery port bound");

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let req = format!(
            "GET /relay-info HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nOrigin: chrome-extension://abc\r\nConnection: close\r\n\r\n",
            port
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf).to_string();

        let (headers, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(headers
            .to_lowercase()
            .contains("access-control-allow-origin: *"));
        let info: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(info["wsUrl"], server.ws_url());
        assert_eq!(info["tabUrl"], "https://example.com");
        assert_eq!(info["tabId"], 3);
        assert_eq!(info["newTab"], false);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_reload_without_peer_is_503() {
        let server = RelayServer::new(&test_config());
        server.start().await.unwrap();
        let port = server
            .start_discovery(DiscoveryHints::default())
            .await
            .unwrap()
            .expect("discovery port bound");

        let (status, body) = http_request(port, "POST", "/reload-extension").await;
        assert_eq!(status, 503);
        assert!(body.contains("error"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_exhausted_port_range_returns_none() {
        // Occupy the only candidate port up front.
        let blocker = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let config = RelayConfig {
            port: 0,
            discovery_ports: vec![taken],
            ..RelayConfig::default()
        };
        let server = RelayServer::new(&config);
        server.start().await.unwrap();

        assert!(server
            .start_discovery(DiscoveryHints::default())
            .await
            .unwrap()
            .is_none());
        // Starting again on the same exhausted range still returns None
        // rather than erroring.
        assert!(server
            .start_discovery(DiscoveryHints::default())
            .await
            .unwrap()
            .is_none());
        server.stop().await;
    }
}
