//! zram-plus: compressed RAM block device with cold-page writeback.
//!
//! Runs one device configured from a JSON file and serves its admin API.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use zram_plus::config::{Cli, Config};
use zram_plus::server::admin_api::{build_router, AppState};
use zram_plus::Zram;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "zram_plus=debug,tower_http=debug"
    } else {
        "zram_plus=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("zram-plus v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    config.validate()?;

    info!(
        disksize = config.device.disksize,
        compressor = %config.device.compressor,
        logical_block_size = config.device.logical_block_size,
        mem_limit = config.device.mem_limit,
        "Configuration loaded"
    );
    if let Some(path) = &config.writeback.backing_path {
        info!(
            path = %path.display(),
            blocks = config.writeback.backing_blocks,
            lru_limit = config.writeback.lru_limit,
            "Backing store configured"
        );
    }

    // Bring up the device.
    let listen_addr = config.server.listen.clone();
    let zram = Arc::new(Zram::from_config(config).await?);

    // Build application state.
    let state = Arc::new(AppState {
        zram: zram.clone(),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down");
    if let Err(e) = zram.reset().await {
        tracing::warn!(error = %e, "Device reset on shutdown failed");
    }

    Ok(())
}
