// packages/relay/src/utils/mod.rs
//! Shared building blocks: the crate error type and relay configuration.

pub mod config;
pub mod errors;

pub use config::RelayConfig;
pub use errors::{RelayError, Result};
