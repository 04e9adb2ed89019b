use tokio::signal;
use tracing::{debug, info, warn};

use webcell_channel::PeerEvent;
use webcell_core::{Config, Paths};
use webcell_relay::{DiscoveryHints, RelayServer};

/// Run the relay + discovery servers until ctrl-c.
pub async fn run(
    port: Option<u16>,
    tab_url: Option<String>,
    new_tab: bool,
) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;
    let mut config = Config::load_or_default(&paths)?;
    if let Some(port) = port {
        config.relay.port = port;
    }
    if tab_url.is_some() {
        config.relay.tab_url = tab_url;
    }
    if new_tab {
        config.relay.new_tab = true;
    }

    let server = RelayServer::new(&config.relay);
    let port = server.start().await?;
    info!(port, "relay ready; waiting for the extension peer");
    info!(url = %server.ws_url(), "extension connect URL");

    let hints = DiscoveryHints {
        tab_url: config.relay.tab_url.clone(),
        tab_id: config.relay.tab_id,
        new_tab: config.relay.new_tab,
    };
    match server.start_discovery(hints).await? {
        Some(discovery_port) => {
            info!(port = discovery_port, "discovery endpoint serving /relay-info");
        }
        None => {
            warn!("all discovery ports are taken; the peer must be pointed at the relay manually");
        }
    }

    let mut events = server.subscribe_events();
    let mut disconnects = server.subscribe_disconnect();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Ok(PeerEvent::Cdp { method, .. }) => debug!(method = %method, "peer event"),
                    Ok(PeerEvent::Detached { tab_id, reason }) => {
                        warn!(tab_id, reason = %reason, "peer detached from its tab");
                    }
                    Err(_) => {}
                }
            }
            reason = disconnects.recv() => {
                if let Ok(reason) = reason {
                    info!(reason = %reason, "peer disconnected; relay keeps listening");
                }
            }
        }
    }

    info!("shutting down relay");
    server.stop().await;
    Ok(())
}
