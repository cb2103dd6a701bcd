//! Couchcast signaling server entry point.
//!
//! Usage: `couchcast-signal [config.toml]`
//!
//! Loads configuration (defaults apply when the file is absent), starts the
//! accept loop, and serves until Ctrl-C.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use couchcast_signal::{run_server, SignalConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging; level overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => SignalConfig::load(Path::new(&path))?,
        None => SignalConfig::default(),
    };
    info!("couchcast-signal starting on {}", config.listen_addr());

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    run_server(config, running).await?;
    info!("couchcast-signal stopped");
    Ok(())
}
