// packages/relay/src/runtime/docker.rs
//! Container runtime
//!
//! [`ContainerRuntime`] is the lifecycle seam container environments are
//! built on. [`DockerRuntime`] implements it against the Docker engine:
//! `bollard` handles images and container lifecycle, while attach is done by
//! hand over the engine's unix socket so the relay gets the raw hijacked
//! stream (stdin in, multiplexed stdout/stderr out).

use crate::runtime::sandbox::Sandbox;
use crate::utils::config::DockerSettings;
use crate::utils::errors::{RelayError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::Empty;
use hyper::header::{CONNECTION, HOST, UPGRADE};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

/// Seconds a container gets to exit before the engine kills it
const STOP_GRACE_SECS: i64 = 5;

/// Bidirectional byte stream to a running container
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Hijacked attach stream
pub type AttachedStream = Box<dyn AsyncStream>;

/// What to run in a new container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Container lifecycle operations used by container environments
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure `image` is available locally
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create a container and return its ID
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Attach to stdin, stdout and stderr
    async fn attach(&self, id: &str) -> Result<AttachedStream>;

    /// Stop a container; already stopped or missing containers are fine
    async fn stop(&self, id: &str) -> Result<()>;

    /// Remove a container; missing containers are fine
    async fn remove(&self, id: &str) -> Result<()>;
}

/// Docker engine implementation of [`ContainerRuntime`]
pub struct DockerRuntime {
    client: Docker,
    socket_path: PathBuf,
    use_only_local: bool,
    pull_timeout: Duration,
    sandbox: Sandbox,
}

impl DockerRuntime {
    /// Connect to the engine on the configured unix socket
    pub fn connect(settings: &DockerSettings) -> Result<Self> {
        let socket = settings.socket_path.to_string_lossy();
        let client = Docker::connect_with_unix(
            &socket,
            settings.api_timeout_secs,
            bollard::API_DEFAULT_VERSION,
        )?;

        info!("Using Docker engine at {}", socket);
        Ok(Self {
            client,
            socket_path: settings.socket_path.clone(),
            use_only_local: settings.use_only_local,
            pull_timeout: Duration::from_secs(settings.api_timeout_secs),
            sandbox: Sandbox::new(settings.into()),
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(self.pull_timeout, async {
            while let Some(progress) = stream.next().await {
                let info = progress?;
                if let Some(error) = info.error {
                    return Err(RelayError::EnvironmentCreation(format!(
                        "failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    debug!("Pull {}: {}", image, status);
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(format!(
                "pulling image {} took longer than {:?}",
                image, self.pull_timeout
            ))),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            debug!("Image {} already present", image);
            return Ok(());
        }
        if self.use_only_local {
            return Err(RelayError::EnvironmentCreation(format!(
                "image {} is not present locally and pulling is disabled",
                image
            )));
        }
        self.pull_image(image).await
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(self.sandbox.host_config()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(false),
            tty: Some(false),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self.client.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            warn!("Docker warning for {}: {}", spec.name, warning);
        }

        debug!("Created container {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<AttachedStream> {
        let socket = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            RelayError::Attach(format!(
                "cannot reach {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(socket))
            .await
            .map_err(|e| RelayError::Attach(format!("handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                debug!("Attach connection ended: {}", e);
            }
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!(
                "/containers/{}/attach?stream=1&stdin=1&stdout=1&stderr=1",
                id
            ))
            .header(HOST, "docker")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "tcp")
            .body(Empty::<Bytes>::new())
            .map_err(|e| RelayError::Attach(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| RelayError::Attach(format!("attach request failed: {}", e)))?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(RelayError::Attach(format!(
                "engine answered attach for {} with {}",
                id,
                response.status()
            )));
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| RelayError::Attach(format!("upgrade failed: {}", e)))?;

        debug!("Attached to container {}", id);
        Ok(Box::new(TokioIo::new(upgraded)))
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match self.client.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
