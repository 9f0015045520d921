//! Main Entrypoint for Voicelink
//!
//! `voicelink talk` runs the streaming client against a remote voice model
//! with the host's default microphone and speakers. `voicelink serve` runs
//! the loopback peer so the client can be tried without a model backend.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;
use voicelink::{config::Config, server};

#[derive(Parser)]
#[command(name = "voicelink", version)]
#[command(about = "Real-time voice streaming over an authenticated WebSocket", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Talk to a remote voice model through the default audio devices.
    Talk {
        /// WebSocket endpoint of the peer (overrides VOICELINK_ENDPOINT).
        #[arg(long, value_name = "URL")]
        endpoint: Option<String>,
    },
    /// Run the loopback peer.
    Serve {
        /// Listen address (overrides BIND_ADDRESS).
        #[arg(long, value_name = "ADDR")]
        bind: Option<SocketAddr>,
    },
}

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Talk { endpoint } => {
            if let Some(endpoint) = endpoint {
                config.endpoint = endpoint;
            }
            talk(config).await
        }
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            serve(config).await
        }
    }
}

#[cfg(feature = "device")]
async fn talk(config: Config) -> anyhow::Result<()> {
    use voicelink::{console, device::CpalDevices};
    use voicelink_core::SessionController;

    info!(
        endpoint = %config.endpoint,
        sample_rate = config.format.sample_rate,
        frame_size = config.format.frame_size,
        "Starting talk session..."
    );
    let controller = SessionController::new(config.session_config(), Arc::new(CpalDevices::new()));
    let view = controller.view();
    let handle = controller.spawn();
    console::run(handle, view).await?;
    info!("Talk session has shut down.");
    Ok(())
}

#[cfg(not(feature = "device"))]
async fn talk(_config: Config) -> anyhow::Result<()> {
    anyhow::bail!("voicelink was built without audio device support (enable the `device` feature)")
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let state = Arc::new(server::PeerState::new(
        config.shared_secret.clone(),
        config.format,
    ));
    info!(
        bind_address = %config.bind_address,
        sample_rate = config.format.sample_rate,
        "Loopback peer configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    server::serve(listener, state, shutdown_signal()).await?;

    info!("Server has shut down.");
    Ok(())
}
