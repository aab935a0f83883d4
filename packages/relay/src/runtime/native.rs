// packages/relay/src/runtime/native.rs
//! Native execution environment: commands run as processes on the relay host.
//!
//! There is nothing to keep warm between runs, so the environment only
//! carries its identity and terminating it is free.

use crate::catalog::Bundle;
use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
use crate::transport::{ExecRequest, ExecResult};
use crate::utils::errors::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct NativeEnvironment {
    id: String,
    bundle: Arc<Bundle>,
    processes: ProcessManager,
}

impl NativeEnvironment {
    pub fn new(id: String, bundle: Arc<Bundle>) -> Self {
        Self {
            id,
            bundle,
            processes: ProcessManager::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle(&self) -> &Arc<Bundle> {
        &self.bundle
    }

    /// Spawn the executable and wait for it
    pub async fn execute(&mut self, request: ExecRequest, timeout: Duration) -> Result<ExecResult> {
        let env_vars = request
            .env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        let config = SpawnConfig {
            executable: PathBuf::from(&request.executable),
            args: request.args,
            work_dir: None,
            env_vars,
            stdin: request.stdin,
            timeout,
        };

        let output = self.processes.run(config).await?;
        debug!(
            "{} exited with {:?} after {:?}",
            request.executable, output.exit_code, output.elapsed
        );

        Ok(ExecResult {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.success,
            elapsed_ms: output.elapsed.as_millis() as u64,
        })
    }

    pub async fn terminate(self) -> Result<()> {
        Ok(())
    }
}
