// packages/relay/src/pool/mod.rs
//! Environment pooling
//!
//! Creating a container costs seconds, so each bundle keeps a small pool of
//! ready environments that are reused across invocations.
//!
//! - **EnvironmentPool**: bounded, reusable environments for one bundle
//! - **PoolRegistry**: one pool per installed bundle, rebuilt on upgrade
//!
//! # Architecture
//!
//! ```text
//! EnvironmentPool (min..=max)
//! ├─ slots: [rec0, rec1, _, rec3]   (arena; `_` is on the free list)
//! ├─ idle:  [3, 0]                  (stack of slot indices)
//! ├─ busy:  {env-id → 1}            (environment held by a worker)
//! └─ burst: untracked overflow, terminated on release
//! ```

pub mod environment_pool;
pub mod registry;

use crate::utils::config::PoolSettings;
use crate::utils::errors::Result;
use async_trait::async_trait;

// Re-export commonly used types
pub use environment_pool::{fill_size, EnvironmentPool, PoolStats};
pub use registry::{MakerFactory, PoolRegistry};

/// An environment that can live in a pool
#[async_trait]
pub trait PooledEnvironment: Send + 'static {
    /// Identifier, unique for the lifetime of the process
    fn id(&self) -> &str;

    /// Release every resource held by the environment
    async fn terminate(self) -> Result<()>;
}

/// Builds environments for one pool
#[async_trait]
pub trait EnvironmentMaker<E>: Send + Sync {
    async fn make(&self) -> Result<E>;
}

/// Pool sizing and reuse policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Environments created up front and kept through reaping
    pub min: usize,

    /// Upper bound on tracked environments
    pub max: usize,

    /// Executions after which an environment is retired
    pub reuse_ceiling: u32,

    /// Create untracked environments when `max` is reached instead of waiting
    pub burst: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 4,
            reuse_ceiling: 20,
            burst: true,
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            min: settings.min,
            max: settings.max,
            reuse_ceiling: settings.reuse_ceiling,
            burst: settings.burst,
        }
    }
}
