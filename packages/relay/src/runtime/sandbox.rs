// packages/relay/src/runtime/sandbox.rs
//! Sandbox policy for bundle containers
//!
//! Every container the relay starts gets the same isolation:
//! - CPU quota (percentage of one core, CFS period of 100ms)
//! - Memory limit
//! - All Linux capabilities dropped, never privileged
//! - Optional network isolation
//!
//! Containers are also labelled with the relay ID and bundle name so stray
//! containers can be traced back to the relay that created them.

use crate::utils::config::DockerSettings;
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use std::collections::HashMap;

/// CFS scheduling period in microseconds
const CPU_PERIOD: i64 = 100_000;

/// Label marking containers managed by a relay
pub const LABEL_RELAY: &str = "io.cog.relay";

/// Label carrying the bundle a container serves
pub const LABEL_BUNDLE: &str = "io.cog.relay.bundle";

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// CPU quota (percentage of one core); zero disables the limit
    pub cpu_quota: u32,

    /// Memory limit in MB; zero disables the limit
    pub memory_limit_mb: u64,

    /// Run without networking
    pub isolate_network: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cpu_quota: 100,
            memory_limit_mb: 512,
            isolate_network: false,
        }
    }
}

impl From<&DockerSettings> for SandboxConfig {
    fn from(settings: &DockerSettings) -> Self {
        Self {
            cpu_quota: settings.cpu_quota,
            memory_limit_mb: settings.memory_limit_mb,
            isolate_network: settings.isolate_network,
        }
    }
}

/// Applies sandbox limits to container definitions
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Host configuration for a bundle container
    pub fn host_config(&self) -> HostConfig {
        let memory = (self.config.memory_limit_mb > 0)
            .then(|| (self.config.memory_limit_mb * 1024 * 1024) as i64);
        let cpu_quota = (self.config.cpu_quota > 0)
            .then(|| (self.config.cpu_quota as i64 * CPU_PERIOD) / 100);

        HostConfig {
            memory,
            cpu_quota,
            cpu_period: cpu_quota.map(|_| CPU_PERIOD),
            network_mode: Some(if self.config.isolate_network { "none" } else { "bridge" }.to_string()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: Some(0),
            }),
            cap_drop: Some(vec!["ALL".to_string()]),
            privileged: Some(false),
            ..Default::default()
        }
    }
}

/// Labels identifying the owning relay and bundle
pub fn container_labels(relay_id: &str, bundle: &str) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_RELAY.to_string(), relay_id.to_string()),
        (LABEL_BUNDLE.to_string(), bundle.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_config_limits() {
        let sandbox = Sandbox::new(SandboxConfig {
            cpu_quota: 50,
            memory_limit_mb: 256,
            isolate_network: true,
        });
        let host = sandbox.host_config();
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.privileged, Some(false));
    }

    #[test]
    fn test_zero_limits_are_unset() {
        let sandbox = Sandbox::new(SandboxConfig {
            cpu_quota: 0,
            memory_limit_mb: 0,
            isolate_network: false,
        });
        let host = sandbox.host_config();
        assert_eq!(host.memory, None);
        assert_eq!(host.cpu_quota, None);
        assert_eq!(host.cpu_period, None);
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
    }

    #[test]
    fn test_from_docker_settings() {
        let settings = DockerSettings::default();
        let config = SandboxConfig::from(&settings);
        assert_eq!(config.memory_limit_mb, settings.memory_limit_mb);
        assert_eq!(config.cpu_quota, settings.cpu_quota);

        let labels = container_labels("relay-1", "echo");
        assert_eq!(labels[LABEL_RELAY], "relay-1");
        assert_eq!(labels[LABEL_BUNDLE], "echo");
    }
}
