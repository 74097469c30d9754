//! Headless data server: runs the configured chunkers and serves their
//! chunks to pipeline clients over TCP.
//!
//! ```bash
//! cargo run --bin daq-stream-server -- --config config/daq_stream.toml
//! RUST_LOG=daq_stream=debug cargo run --bin daq-stream-server
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use daq_stream::chunker::{ChunkerManager, ChunkerRegistry};
use daq_stream::config::Settings;
use daq_stream::data::DataManager;
use daq_stream::server::DataServer;

#[derive(Debug, Parser)]
#[command(name = "daq-stream-server", version, about = "Real-time chunk buffer server")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config/daq_stream.toml")]
    config: PathBuf,

    /// Override the listening host
    #[arg(long)]
    host: Option<String>,

    /// Override the listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(level) = args.log_level {
        settings.server.log_level = level;
    }
    settings.validate()?;

    if args.print_config {
        print!("{}", settings.to_toml_string()?);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.server.log_level));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    info!(
        stream_chunkers = settings.stream_chunkers().count(),
        service_chunkers = settings.service_chunkers().count(),
        "Starting data server"
    );

    let data = Arc::new(DataManager::new(settings.buffers.clone()));
    let mut chunkers = ChunkerManager::from_settings(ChunkerRegistry::with_builtin(), &settings)?;
    chunkers
        .init(Arc::clone(&data))
        .context("starting chunkers")?;

    let address = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {}", address))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
        let _ = shutdown_tx.send(true);
    });

    let server = DataServer::new(Arc::clone(&data), &settings.server);
    server.serve(listener, shutdown_rx).await?;

    tokio::task::spawn_blocking(move || chunkers.stop())
        .await
        .context("joining chunker shutdown")??;
    info!("Server exited cleanly");
    Ok(())
}
