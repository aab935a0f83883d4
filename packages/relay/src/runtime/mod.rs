// packages/relay/src/runtime/mod.rs
//! Execution environments
//!
//! This module provides the places bundle commands actually run:
//!
//! - **Container**: a sandboxed bundle container driven over the attach stream
//! - **Native**: a process spawned on the relay host
//! - **Docker**: the container runtime seam and its Docker engine implementation
//! - **Sandbox**: resource limits and labels applied to every container
//! - **Process Manager**: process spawning, output capture and timeouts
//!
//! # Architecture
//!
//! ```text
//! EnvironmentFactory ──maker_for(bundle)──▶ BundleMaker
//!                                               │
//!                      bundle.docker? ──yes──▶ Environment::Container
//!                            │                    └─ driver RPC over attach stream
//!                            no
//!                            ▼
//!                     Environment::Native
//!                            └─ ProcessManager::run
//! ```

pub mod container;
pub mod docker;
pub mod native;
pub mod process_manager;
pub mod sandbox;

use crate::catalog::Bundle;
use crate::pool::{EnvironmentMaker, MakerFactory, PooledEnvironment};
use crate::transport::{ExecRequest, ExecResult};
use crate::utils::errors::{RelayError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

// Re-export commonly used types
pub use container::{ContainerEnvironment, ContainerTemplate};
pub use docker::{AttachedStream, ContainerRuntime, ContainerSpec, DockerRuntime};
pub use native::NativeEnvironment;
pub use process_manager::{ProcessManager, ProcessOutput, SpawnConfig};
pub use sandbox::{Sandbox, SandboxConfig};

/// Where a bundle's commands run; chosen once per bundle
pub enum Environment {
    Container(ContainerEnvironment),
    Native(NativeEnvironment),
}

impl Environment {
    pub fn id(&self) -> &str {
        match self {
            Environment::Container(env) => env.id(),
            Environment::Native(env) => env.id(),
        }
    }

    pub fn bundle(&self) -> &Arc<Bundle> {
        match self {
            Environment::Container(env) => env.bundle(),
            Environment::Native(env) => env.bundle(),
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Environment::Container(_))
    }

    /// Run one command to completion
    pub async fn execute(&mut self, request: ExecRequest, timeout: Duration) -> Result<ExecResult> {
        match self {
            Environment::Container(env) => env.execute(request, timeout).await,
            Environment::Native(env) => env.execute(request, timeout).await,
        }
    }
}

#[async_trait]
impl PooledEnvironment for Environment {
    fn id(&self) -> &str {
        Environment::id(self)
    }

    async fn terminate(self) -> Result<()> {
        match self {
            Environment::Container(env) => env.terminate().await,
            Environment::Native(env) => env.terminate().await,
        }
    }
}

/// Builds environments for one bundle
pub struct BundleMaker {
    bundle: Arc<Bundle>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    template: ContainerTemplate,
}

#[async_trait]
impl EnvironmentMaker<Environment> for BundleMaker {
    async fn make(&self) -> Result<Environment> {
        let id = Ulid::new().to_string();

        if !self.bundle.is_containerized() {
            return Ok(Environment::Native(NativeEnvironment::new(id, self.bundle.clone())));
        }

        let runtime = self.runtime.clone().ok_or_else(|| {
            RelayError::EnvironmentCreation(format!(
                "bundle '{}' needs a container runtime, but none is configured",
                self.bundle.name
            ))
        })?;
        let env = ContainerEnvironment::create(id, self.bundle.clone(), runtime, &self.template).await?;
        Ok(Environment::Container(env))
    }
}

/// Hands each bundle pool a [`BundleMaker`]
pub struct EnvironmentFactory {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    template: ContainerTemplate,
}

impl EnvironmentFactory {
    /// `runtime` may be absent on hosts without a container engine; only
    /// native bundles can run there.
    pub fn new(runtime: Option<Arc<dyn ContainerRuntime>>, template: ContainerTemplate) -> Self {
        Self { runtime, template }
    }
}

impl MakerFactory<Environment> for EnvironmentFactory {
    fn maker_for(&self, bundle: Arc<Bundle>) -> Arc<dyn EnvironmentMaker<Environment>> {
        Arc::new(BundleMaker {
            bundle,
            runtime: self.runtime.clone(),
            template: self.template.clone(),
        })
    }
}
