// packages/relay/src/observability/mod.rs
//! Logging and metrics setup
//!
//! - **Tracing**: `tracing-subscriber` with `RUST_LOG` filtering, plain or JSON
//! - **Metrics**: Prometheus exporter for relay counters
//!
//! Metric names are collected here so every module records against the same
//! keys.

use crate::utils::config::ObservabilitySettings;
use crate::utils::errors::{RelayError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Executions completed, labelled by response status
pub const EXECUTIONS_TOTAL: &str = "relay_executions_total";

/// Environments created by pools, labelled by kind (`pooled` or `burst`)
pub const ENVIRONMENTS_CREATED: &str = "relay_environments_created_total";

/// Environments terminated by pools
pub const ENVIRONMENTS_TERMINATED: &str = "relay_environments_terminated_total";

/// Announcements published (first sends and retries)
pub const ANNOUNCEMENTS_PUBLISHED: &str = "relay_announcements_published_total";

/// Receipts discarded because they matched no outstanding announcement
pub const RECEIPTS_IGNORED: &str = "relay_receipts_ignored_total";

/// Install the global tracing subscriber
///
/// Logs go to stderr; stdout may carry bus or driver traffic.
pub fn init_tracing(settings: &ObservabilitySettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = if settings.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| RelayError::Config(format!("failed to install tracing: {}", e)))
}

/// Install the Prometheus recorder when a metrics address is configured
pub fn init_metrics(settings: &ObservabilitySettings) -> Result<()> {
    let Some(addr) = &settings.metrics_addr else {
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| RelayError::Config(format!("invalid metrics address '{}': {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| RelayError::Config(format!("failed to install metrics exporter: {}", e)))?;

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}
