// packages/relay/src/lib.rs
//! Cog Relay Library
//!
//! A relay node that executes chat commands on behalf of an upstream bot.
//! Commands come from installed bundles and run either natively or inside
//! Docker containers driven over a framed stdio protocol.
//!
//! # Architecture
//!
//! - **transport**: Frame headers, framed streams and the partial-decode RPC
//! - **runtime**: Native processes and container environments
//! - **pool**: Per-bundle environment pools with reuse ceilings
//! - **catalog**: Installed bundles with epoch and acknowledgment tracking
//! - **announcer**: At-least-once catalog announcements
//! - **executor**: Request decoding, calling environment and output parsing
//! - **bus**: Publish/subscribe session abstraction and its adapters
//! - **relay**: The service that wires everything to a bus session
//! - **driver**: The request loop run inside bundle containers
//! - **observability**: Logging and metrics
//! - **utils**: Configuration and errors

pub mod announcer;
pub mod bus;
pub mod catalog;
pub mod driver;
pub mod executor;
pub mod observability;
pub mod pool;
pub mod relay;
pub mod runtime;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use catalog::BundleCatalog;
pub use executor::{ExecutionEngine, ExecutionRequest, ExecutionResponse};
pub use relay::Relay;
pub use utils::config::RelayConfig;
pub use utils::errors::{RelayError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
