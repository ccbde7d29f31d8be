//! baseio server binary
//!
//! Runs an echo service on the configured codec and runtime:
//! every decoded message is written back to its sender.

use baseio::config::Config;
use baseio::protocols::build_codec;
use baseio::runtime::{self, EchoHandler};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        protocol = %config.protocol,
        runtime = ?config.runtime,
        max_frame_size = config.max_frame_size,
        "Starting baseio server"
    );

    let codec = build_codec(config.protocol, config.limits());
    let server = runtime::start(&config, codec, Arc::new(EchoHandler))?;
    info!(addr = %server.local_addr(), "Listening");

    server.join();
    Ok(())
}
