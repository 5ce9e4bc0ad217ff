//! sshnope binary
//!
//! SSH tarpit that stalls and records password attempts.
//!
//! ## Usage
//!
//! ```bash
//! # Run with defaults (port 8022, ./ssh_host_key, ./ssh_credentials.csv)
//! sshnope
//!
//! # Overrides
//! sshnope --port 22 --max-connections 100 --stall-delay 30
//! sshnope --config /etc/sshnope.ron
//! sshnope --ephemeral-host-key
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sshnope_server::{KeySource, TarpitConfig, TarpitServer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sshnope", version, about = "SSH tarpit that stalls and records password attempts")]
struct Cli {
    /// RON config file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// OpenSSH private key used as the host key
    #[arg(long, conflicts_with = "ephemeral_host_key")]
    host_key: Option<PathBuf>,

    /// Generate a throwaway Ed25519 host key instead of loading one
    #[arg(long)]
    ephemeral_host_key: bool,

    /// Maximum concurrently admitted connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Seconds to hold each password attempt before rejecting it
    #[arg(long)]
    stall_delay: Option<u64>,

    /// CSV file captured credentials are appended to
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write buffer size for the CSV file, in bytes
    #[arg(long)]
    flush_buffer_size: Option<usize>,

    /// Drain early once this many credentials are waiting
    #[arg(long)]
    drain_threshold: Option<usize>,

    /// SSH identification string sent to clients
    #[arg(long)]
    server_id: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut TarpitConfig) {
        if let Some(bind) = &self.bind {
            config.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = &self.host_key {
            config.host_key_path = path.clone();
        }
        if let Some(max) = self.max_connections {
            config.max_active_connections = max;
        }
        if let Some(secs) = self.stall_delay {
            config.stall_delay_secs = secs;
        }
        if let Some(path) = &self.output {
            config.output_path = path.clone();
        }
        if let Some(size) = self.flush_buffer_size {
            config.flush_buffer_size = size;
        }
        if let Some(threshold) = self.drain_threshold {
            config.drain_threshold = Some(threshold);
        }
        if let Some(id) = &self.server_id {
            config.server_id = id.clone();
        }
    }

    fn key_source(&self, config: &TarpitConfig) -> KeySource {
        if self.ephemeral_host_key {
            KeySource::Ephemeral
        } else {
            KeySource::File(config.host_key_path.clone())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match TarpitConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error starting server: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => TarpitConfig::default(),
    };
    cli.apply(&mut config);
    let keys = cli.key_source(&config);

    run_server(config, keys).await
}

async fn run_server(config: TarpitConfig, keys: KeySource) -> ExitCode {
    let server = match TarpitServer::bind(&config, keys).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Error starting server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Interrupt received, stopping");
            shutdown.cancel();
        }
    });

    server.run(shutdown).await;
    ExitCode::SUCCESS
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
