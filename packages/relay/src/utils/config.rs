// packages/relay/src/utils/config.rs
//! Relay configuration
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `RELAY_` environment overrides using `__` as the section separator
//! (for example `RELAY_POOL__MAX=8`).

use crate::utils::errors::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "RELAY";

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub relay: RelaySettings,
    pub bus: BusSettings,
    pub docker: DockerSettings,
    pub pool: PoolSettings,
    pub execution: ExecutionSettings,
    pub announcer: AnnouncerSettings,
    pub observability: ObservabilitySettings,
}

/// Identity and work-queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Relay ID announced upstream
    pub id: String,

    /// Number of concurrent execution workers
    pub workers: usize,

    /// Capacity of the pending request queue
    pub queue_capacity: usize,

    /// Directory holding bundle definitions
    pub bundles_dir: PathBuf,

    /// How often the bundle directory is rescanned (seconds)
    pub refresh_interval_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            workers: 8,
            queue_capacity: 256,
            bundles_dir: PathBuf::from("/var/lib/cog-relay/bundles"),
            refresh_interval_secs: 30,
        }
    }
}

/// Message bus connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Session client ID; defaults to the relay ID
    pub client_id: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsSettings,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            client_id: None,
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            tls: TlsSettings::default(),
        }
    }
}

/// TLS settings for the bus connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,

    /// CA bundle used to verify the broker; absent disables verification
    pub ca_path: Option<PathBuf>,
}

/// Container runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// Docker engine unix socket
    pub socket_path: PathBuf,

    /// Path of the relay driver inside bundle images
    pub driver_path: String,

    /// Never pull images; only use what is present locally
    pub use_only_local: bool,

    /// Docker API timeout (seconds)
    pub api_timeout_secs: u64,

    /// Memory limit per container in MB
    pub memory_limit_mb: u64,

    /// CPU quota per container (percentage of one core)
    pub cpu_quota: u32,

    /// Disable networking inside bundle containers
    pub isolate_network: bool,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/docker.sock"),
            driver_path: "/usr/local/bin/relay-driver".to_string(),
            use_only_local: false,
            api_timeout_secs: 120,
            memory_limit_mb: 512,
            cpu_quota: 100,
            isolate_network: false,
        }
    }
}

/// Environment pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min: usize,
    pub max: usize,

    /// Executions after which an environment is retired
    pub reuse_ceiling: u32,

    /// Hand out untracked environments when the pool is full
    pub burst: bool,

    /// Idle environments unused this long are reaped (seconds)
    pub max_idle_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min: 1,
            max: 4,
            reuse_ceiling: 20,
            burst: true,
            max_idle_secs: 300,
        }
    }
}

/// Command execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Operator-declared extra environment, as `KEY=VALUE` entries
    pub extra_env: Vec<String>,

    /// Root of the per-bundle dynamic configuration tree
    pub dynamic_config_root: Option<PathBuf>,

    /// Upper bound on a single command execution (seconds)
    pub timeout_secs: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            extra_env: Vec::new(),
            dynamic_config_root: None,
            timeout_secs: 60,
        }
    }
}

/// Announcer timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnouncerSettings {
    /// Re-publish interval while awaiting a receipt (milliseconds)
    pub retry_interval_ms: u64,

    /// Delay before retrying a failed publish (milliseconds)
    pub publish_backoff_ms: u64,
}

impl Default for AnnouncerSettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: 5_000,
            publish_backoff_ms: 1_000,
        }
    }
}

/// Logging and metrics settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Emit JSON log lines
    pub json_logs: bool,

    /// Prometheus listen address; metrics are disabled when unset
    pub metrics_addr: Option<String>,
}

impl RelayConfig {
    /// Load configuration from an optional YAML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(RelayError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: RelayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.relay.id.trim().is_empty() {
            return Err(RelayError::Config("relay.id must be set".into()));
        }
        if self.relay.workers == 0 {
            return Err(RelayError::Config("relay.workers must be at least 1".into()));
        }
        if self.relay.queue_capacity == 0 {
            return Err(RelayError::Config(
                "relay.queue_capacity must be at least 1".into(),
            ));
        }
        if self.pool.max == 0 || self.pool.min > self.pool.max {
            return Err(RelayError::Config(format!(
                "pool bounds invalid: min={} max={}",
                self.pool.min, self.pool.max
            )));
        }
        if self.pool.reuse_ceiling == 0 {
            return Err(RelayError::Config(
                "pool.reuse_ceiling must be at least 1".into(),
            ));
        }
        for entry in &self.execution.extra_env {
            if !entry.contains('=') {
                return Err(RelayError::Config(format!(
                    "execution.extra_env entry '{}' is not KEY=VALUE",
                    entry
                )));
            }
        }
        if let Some(ca) = &self.bus.tls.ca_path {
            if !ca.exists() {
                return Err(RelayError::Config(format!(
                    "bus.tls.ca_path {} does not exist",
                    ca.display()
                )));
            }
        }
        if self.bus.tls.enabled && self.bus.tls.ca_path.is_none() {
            warn!("TLS enabled without a CA bundle; broker certificate will not be verified");
        }
        Ok(())
    }

    /// Operator extra environment as key/value pairs
    pub fn extra_env(&self) -> Vec<(String, String)> {
        self.execution
            .extra_env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn client_id(&self) -> String {
        self.bus
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.relay.id.clone())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.relay.refresh_interval_secs.max(1))
    }
}
