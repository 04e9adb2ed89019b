mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "webcell")]
#[command(about = "Control channel between an agent, a browser peer, and a host process", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay and discovery servers (long-running)
    Relay {
        /// Port for the relay WebSocket listener (overrides config relay.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Tab URL hint served to a self-discovering peer
        #[arg(long)]
        tab_url: Option<String>,

        /// Ask the peer to open a fresh tab instead of attaching
        #[arg(long)]
        new_tab: bool,
    },

    /// Call a host-process RPC method over the pipe
    Call {
        /// Method name (e.g. "terminal.read")
        method: String,

        /// JSON parameters (defaults to {})
        params: Option<String>,
    },

    /// Run environment diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Relay {
            port,
            tab_url,
            new_tab,
        } => {
            commands::relay::run(port, tab_url, new_tab).await?;
        }
        Commands::Call { method, params } => {
            commands::call::run(method, params).await?;
        }
        Commands::Doctor => {
            commands::doctor::run().await?;
        }
    }

    Ok(())
}
