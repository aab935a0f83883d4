// packages/relay/src/bin/relay_driver.rs
//! Driver started inside bundle containers
//!
//! Speaks the framed request protocol over stdin/stdout and exits when the
//! relay sends a die request or closes stdin.

use anyhow::Result;
use cog_relay::driver::{serve, DRIVER_TIMEOUT};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let served = serve(tokio::io::stdin(), tokio::io::stdout(), DRIVER_TIMEOUT).await?;
    info!("Driver exiting after {} requests", served);
    Ok(())
}
