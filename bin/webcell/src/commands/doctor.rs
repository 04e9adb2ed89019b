use serde_json::json;
use std::time::Duration;
use tokio::net::TcpListener;

use webcell_core::{Config, Paths};
use webcell_pipe::PipeClient;

/// Run full environment diagnostics.
pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!();
    println!("🩺 webcell doctor — Environment Diagnostics");
    println!("================================");
    println!();

    let mut ok_count = 0u32;
    let mut warn_count = 0u32;
    let mut err_count = 0u32;

    // --- 1. Config ---
    println!("📋 Configuration");
    let config_exists = paths.config_file().exists();
    if config_exists {
        print_ok("Config file exists", &paths.config_file().display().to_string());
        ok_count += 1;
    } else {
        print_warn("Config file not found", "Defaults will be used");
        warn_count += 1;
    }
    let config = Config::load_or_default(&paths)?;
    println!();

    // --- 2. Host pipe ---
    println!("🔌 Host process pipe");
    let pipe_path = Paths::pipe_path(&config.pipe.socket_name);
    #[cfg(unix)]
    {
        if pipe_path.exists() {
            print_ok("Pipe socket present", &pipe_path.display().to_string());
            ok_count += 1;
        } else {
            print_warn(
                "Pipe socket not found",
                "The host process creates it on startup",
            );
            warn_count += 1;
        }
    }

    let client = PipeClient::new(
        &pipe_path,
        Duration::from_millis(config.pipe.probe_timeout_ms),
    );
    match client.call("ping", json!({})).await {
        Ok(_) => {
            print_ok("Host process responding", "");
            ok_count += 1;
        }
        Err(e) => {
            print_err("Host process not responding", &e.to_string());
            err_count += 1;
        }
    }
    println!();

    // --- 3. Relay ports ---
    println!("🌐 Relay ports");
    if config.relay.port != 0 {
        match TcpListener::bind(("127.0.0.1", config.relay.port)).await {
            Ok(_) => {
                print_ok(
                    "Relay port available",
                    &format!("127.0.0.1:{}", config.relay.port),
                );
                ok_count += 1;
            }
            Err(e) => {
                print_err(
                    &format!("Relay port {} unavailable", config.relay.port),
                    &e.to_string(),
                );
                err_count += 1;
            }
        }
    } else {
        print_ok("Relay port", "OS-assigned (port 0)");
        ok_count += 1;
    }

    let mut free_discovery = None;
    for &port in &config.relay.discovery_ports {
        if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            free_discovery = Some(port);
            break;
        }
    }
    match free_discovery {
        Some(port) => {
            print_ok("Discovery port available", &port.to_string());
            ok_count += 1;
        }
        None => {
            print_warn(
                "No discovery port available",
                "The extension peer cannot self-discover the relay",
            );
            warn_count += 1;
        }
    }
    println!();

    // --- Summary ---
    println!("================================");
    println!(
        "Summary: {} ok, {} warnings, {} errors",
        ok_count, warn_count, err_count
    );
    println!();

    Ok(())
}

fn print_ok(label: &str, detail: &str) {
    if detail.is_empty() {
        println!("  ✅ {}", label);
    } else {
        println!("  ✅ {} — {}", label, detail);
    }
}

fn print_warn(label: &str, hint: &str) {
    if hint.is_empty() {
        println!("  ⚠️  {}", label);
    } else {
        println!("  ⚠️  {} — {}", label, hint);
    }
}

fn print_err(label: &str, hint: &str) {
    if hint.is_empty() {
        println!("  ❌ {}", label);
    } else {
        println!("  ❌ {} — {}", label, hint);
    }
}
