// packages/relay/src/executor/engine.rs
//! Execution engine
//!
//! Resolves a `bundle:command` reference against the catalog, borrows an
//! environment from the bundle's pool, runs the command and turns its output
//! into a response. Every request yields exactly one response; failures are
//! reported as `error` responses rather than propagated.

use crate::catalog::{Bundle, BundleCatalog};
use crate::executor::dynconfig::{flatten, DynamicConfigStore};
use crate::executor::env::CallingEnvironment;
use crate::executor::output::parse_output;
use crate::executor::request::{ExecutionRequest, ExecutionResponse};
use crate::observability::EXECUTIONS_TOTAL;
use crate::pool::PoolRegistry;
use crate::runtime::Environment;
use crate::transport::ExecRequest;
use crate::utils::errors::{RelayError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ExecutionEngine {
    catalog: Arc<BundleCatalog>,
    pools: Arc<PoolRegistry<Environment>>,
    dynamic: DynamicConfigStore,
    extra_env: Vec<(String, String)>,
    timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(catalog: Arc<BundleCatalog>, pools: Arc<PoolRegistry<Environment>>) -> Self {
        Self {
            catalog,
            pools,
            dynamic: DynamicConfigStore::default(),
            extra_env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_dynamic_config(mut self, dynamic: DynamicConfigStore) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Operator-declared variables added to every execution
    pub fn with_extra_env(mut self, extra_env: Vec<(String, String)>) -> Self {
        self.extra_env = extra_env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pools(&self) -> &Arc<PoolRegistry<Environment>> {
        &self.pools
    }

    /// Run one request to a terminal response
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResponse {
        let response = match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(command = %request.command, "Execution failed: {}", e);
                ExecutionResponse::error(e.to_string())
            }
        };

        metrics::counter!(EXECUTIONS_TOTAL, "status" => response.status.as_str()).increment(1);
        response
    }

    async fn dispatch(&self, request: &ExecutionRequest) -> Result<ExecutionResponse> {
        let (bundle_name, command_name) = request.bundle_and_command()?;

        let bundle = self
            .catalog
            .lookup(bundle_name)
            .ok_or_else(|| RelayError::BundleNotFound(bundle_name.to_string()))?;
        let command = bundle
            .command(command_name)
            .ok_or_else(|| RelayError::CommandNotFound {
                bundle: bundle_name.to_string(),
                command: command_name.to_string(),
            })?;

        let exec = ExecRequest {
            executable: command.executable.clone(),
            args: Vec::new(),
            env: self
                .calling_environment(request, &bundle, command_name)
                .await?
                .into_entries(),
            stdin: serde_json::to_vec(&request.cog_env)?,
            die: false,
        };

        let pool = self.pools.pool_for(&bundle).await?;
        let mut env = pool.acquire().await?;
        debug!(
            command = %request.command,
            container = env.is_container(),
            "Running in environment {}",
            env.id()
        );

        let result = match env.execute(exec, self.timeout).await {
            Ok(result) => result,
            Err(e) if e.is_connection_fatal() => {
                pool.remove(env).await;
                return Err(e);
            }
            Err(e) => {
                pool.release(env).await;
                return Err(e);
            }
        };

        if !result.success && !result.stderr.is_empty() {
            pool.remove(env).await;
            return Ok(ExecutionResponse::error(
                String::from_utf8_lossy(&result.stderr).into_owned(),
            ));
        }

        pool.release(env).await;
        Ok(parse_output(
            &result.stdout,
            &result.stderr,
            result.success,
            &request.command,
        ))
    }

    async fn calling_environment(
        &self,
        request: &ExecutionRequest,
        bundle: &Bundle,
        command: &str,
    ) -> Result<CallingEnvironment> {
        let mut env = CallingEnvironment::for_request(request, &bundle.name, command);

        // File first, so per-invocation config overrides it
        env.extend_unreserved("dynamic config", self.dynamic.load(&bundle.name).await?);
        if let Some(config) = &request.command_config {
            env.extend_unreserved("command config", flatten(config));
        }
        env.extend_unreserved("extra env", self.extra_env.iter().cloned());

        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::container_bundle;
    use crate::catalog::BundleCommand;
    use crate::executor::request::ResponseStatus;
    use crate::pool::PoolConfig;
    use crate::runtime::container::test_support::FakeRuntime;
    use crate::runtime::{ContainerRuntime, ContainerTemplate, EnvironmentFactory};
    use semver::Version;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn native_bundle(name: &str, commands: &[(&str, &str)]) -> Bundle {
        let commands = commands
            .iter()
            .map(|(command, executable)| {
                (
                    command.to_string(),
                    BundleCommand {
                        executable: executable.to_string(),
                        options: BTreeMap::new(),
                        rules: vec![],
                    },
                )
            })
            .collect();
        Bundle {
            name: name.to_string(),
            version: Version::new(1, 0, 0),
            permissions: vec![],
            docker: None,
            commands,
            templates: BTreeMap::new(),
        }
    }

    fn engine(bundles: Vec<Bundle>, runtime: Option<Arc<dyn ContainerRuntime>>) -> ExecutionEngine {
        let catalog = Arc::new(BundleCatalog::new());
        catalog.replace(bundles);

        let factory = EnvironmentFactory::new(
            runtime,
            ContainerTemplate {
                relay_id: "relay-1".into(),
                driver_path: "/usr/local/bin/relay-driver".into(),
            },
        );
        let config = PoolConfig {
            min: 1,
            max: 2,
            ..Default::default()
        };
        let pools = Arc::new(PoolRegistry::new(config, Arc::new(factory)));
        ExecutionEngine::new(catalog, pools).with_timeout(Duration::from_secs(10))
    }

    fn request(command: &str) -> ExecutionRequest {
        ExecutionRequest {
            command: command.into(),
            reply_to: "/bot/pipelines/p1/replies".into(),
            pipeline_id: "p1".into(),
            ..Default::default()
        }
    }

    fn body_lines(response: &ExecutionResponse) -> Vec<String> {
        response.body.as_ref().unwrap()[0]["body"]
            .as_array()
            .unwrap()
            .iter()
            .map(|line| line.as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_native_command_sees_calling_environment() {
        let engine = engine(vec![native_bundle("sys", &[("env", "/usr/bin/env")])], None)
            .with_extra_env(vec![
                ("REGION".into(), "us-east-1".into()),
                ("COG_BUNDLE".into(), "shadowed".into()),
            ]);

        let mut request = request("sys:env");
        request.args = vec![json!("first")];
        request.command_config = json!({"TOKEN": "abc"}).as_object().cloned();

        let response = engine.execute(&request).await;
        assert_eq!(response.status, ResponseStatus::Ok, "{}", response.status_message);

        let lines = body_lines(&response);
        for expected in [
            "COG_BUNDLE=sys",
            "COG_COMMAND=env",
            "COG_ARGC=1",
            "COG_ARGV_0=first",
            "COG_PIPELINE_ID=p1",
            "TOKEN=abc",
            "REGION=us-east-1",
        ] {
            assert!(lines.iter().any(|line| line == expected), "missing {}", expected);
        }
        assert!(!lines.iter().any(|line| line == "COG_BUNDLE=shadowed"));
    }

    #[tokio::test]
    async fn test_cog_env_written_to_stdin() {
        let engine = engine(vec![native_bundle("sys", &[("cat", "/bin/cat")])], None);
        let mut request = request("sys:cat");
        request.cog_env = json!({"user": "vanstee"});

        let response = engine.execute(&request).await;
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(body_lines(&response), vec![r#"{"user":"vanstee"}"#]);
    }

    #[tokio::test]
    async fn test_dynamic_config_file_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sys")).unwrap();
        std::fs::write(dir.path().join("sys").join("config.yml"), "API_URL: http://x\nRELAY_ID: no\n").unwrap();

        let engine = engine(vec![native_bundle("sys", &[("env", "/usr/bin/env")])], None)
            .with_dynamic_config(DynamicConfigStore::new(Some(dir.path().to_path_buf())));

        let response = engine.execute(&request("sys:env")).await;
        let lines = body_lines(&response);
        assert!(lines.iter().any(|line| line == "API_URL=http://x"));
        assert!(!lines.iter().any(|line| line.starts_with("RELAY_ID=")));
    }

    #[tokio::test]
    async fn test_failure_with_stderr_evicts_environment() {
        // `sh` reads the JSON `null` from stdin as a command name and fails
        let bundle = native_bundle("sys", &[("sh", "/bin/sh"), ("env", "/usr/bin/env")]);
        let engine = engine(vec![bundle], None);

        let response = engine.execute(&request("sys:sh")).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.status_message.contains("null"), "{}", response.status_message);

        let bundle = engine.catalog.lookup("sys").unwrap();
        let pool = engine.pools().pool_for(&bundle).await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.idle + stats.busy, 0);

        let response = engine.execute(&request("sys:env")).await;
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(pool.stats().await.idle, 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_keeps_environment() {
        let engine = engine(vec![native_bundle("sys", &[("gone", "/nonexistent/bin/tool")])], None);

        let response = engine.execute(&request("sys:gone")).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.status_message.contains("/nonexistent/bin/tool"), "{}", response.status_message);

        let bundle = engine.catalog.lookup("sys").unwrap();
        let stats = engine.pools().pool_for(&bundle).await.unwrap().stats().await;
        assert_eq!((stats.idle, stats.busy), (1, 0));
    }

    #[tokio::test]
    async fn test_failure_without_stderr() {
        let engine = engine(vec![native_bundle("sys", &[("false", "/bin/false")])], None);
        let response = engine.execute(&request("sys:false")).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.status_message, "command failed");
    }

    #[tokio::test]
    async fn test_unresolvable_commands() {
        let engine = engine(vec![native_bundle("sys", &[("env", "/usr/bin/env")])], None);

        let response = engine.execute(&request("nocolon")).await;
        assert_eq!(response.status, ResponseStatus::Error);

        let response = engine.execute(&request("missing:env")).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.status_message.contains("missing"));

        let response = engine.execute(&request("sys:nope")).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.status_message.contains("nope"));

        // Nothing was resolved, so no pool was built
        assert!(engine.pools().is_empty());
    }

    #[tokio::test]
    async fn test_container_command_runs_through_driver() {
        let runtime = Arc::new(FakeRuntime::default());
        let shared: Arc<dyn ContainerRuntime> = runtime.clone();
        let engine = engine(vec![container_bundle("echo", "1.0.0")], Some(shared));

        let response = engine.execute(&request("echo:run")).await;
        assert_eq!(response.status, ResponseStatus::Ok, "{}", response.status_message);
        assert_eq!(response.body, Some(json!([{"body": ["ran /opt/echo/run"]}])));

        // Released back to the pool, not torn down
        assert!(!runtime.calls().iter().any(|call| call.starts_with("stop")));
        engine.pools().close_all().await;
        assert!(runtime.calls().iter().any(|call| call.starts_with("remove")));

        let encoded: Value = serde_json::from_slice(&response.to_json().unwrap()).unwrap();
        assert_eq!(encoded["status"], "ok");
    }
}
