// packages/relay/src/main.rs
//! Cog Relay
//!
//! Serves bundle commands to an upstream bot. The bus session is bridged as
//! JSON lines over stdin/stdout, so a broker sidecar owns the network side.

use anyhow::Result;
use cog_relay::bus::{BusConnector, LinesConnector};
use cog_relay::observability::{init_metrics, init_tracing};
use cog_relay::runtime::{ContainerRuntime, DockerRuntime};
use cog_relay::{Relay, RelayConfig, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = RelayConfig::load(config_path.as_deref())?;

    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    info!("Starting Cog Relay v{} as {}", VERSION, config.relay.id);

    let runtime: Option<Arc<dyn ContainerRuntime>> = match DockerRuntime::connect(&config.docker) {
        Ok(docker) => Some(Arc::new(docker)),
        Err(e) => {
            warn!("Docker unavailable, only native bundles will run: {}", e);
            None
        }
    };

    let connector: Arc<dyn BusConnector> = Arc::new(LinesConnector::stdio());

    // Graceful shutdown handler
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal, cleaning up..."),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    match Relay::new(config, runtime).run(connector, shutdown).await {
        Ok(()) => {
            info!("Relay stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Relay error: {}", e);
            Err(e.into())
        }
    }
}
