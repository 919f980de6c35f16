//! Data server binary.
//!
//! Loads the TOML configuration, builds the buffer registry, connects one
//! receiver per configured instrument stream and serves buffer contents to
//! remote data clients until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use rust_pipeline::buffer::BufferRegistry;
use rust_pipeline::config::Settings;
use rust_pipeline::network::server::DataServer;
use rust_pipeline::receiver::{Receiver, ReceiverHandle, TcpChunkSource};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rust_pipeline")]
#[command(about = "Buffering data server for pipeline processing", long_about = None)]
struct Cli {
    /// Configuration name, resolved as config/<name>.toml
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::new(cli.config.as_deref()).context("loading configuration")?;
    settings.validate().context("validating configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let registry = Arc::new(BufferRegistry::from_settings(&settings));
    info!(buffers = registry.len(), "Buffer registry built");

    let mut receivers: Vec<(String, ReceiverHandle)> = Vec::new();
    for (name, receiver_settings) in &settings.receivers {
        let buffer = Arc::clone(registry.require(name)?);
        let source = TcpChunkSource::connect(&receiver_settings.source)
            .await
            .with_context(|| format!("connecting receiver '{name}' to {}", receiver_settings.source))?;
        info!(
            buffer = name.as_str(),
            source = %receiver_settings.source,
            "Receiver connected"
        );
        receivers.push((name.clone(), Receiver::new(buffer, Box::new(source)).spawn()));
    }

    let server = DataServer::from_settings(&settings, Arc::clone(&registry)).await?;
    info!(addr = %server.local_addr()?, "Serving data");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "Data server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
    }

    for (name, handle) in receivers {
        handle.stop();
        let report = handle.join().await;
        if report.dropped > 0 {
            warn!(
                buffer = name.as_str(),
                committed = report.committed,
                dropped = report.dropped,
                "Receiver finished with dropped chunks"
            );
        } else {
            info!(
                buffer = name.as_str(),
                committed = report.committed,
                "Receiver finished"
            );
        }
    }

    Ok(())
}
