// packages/relay/src/runtime/container.rs
//! Container-backed execution environment
//!
//! Each environment is one long-lived container running the relay driver.
//! Requests go to the driver's stdin as circuit-framed CBOR; results come
//! back on the stdout channel of the container stream. Anything the driver
//! writes to stderr is drained and dropped.

use crate::catalog::Bundle;
use crate::runtime::docker::{AttachedStream, ContainerRuntime, ContainerSpec};
use crate::runtime::sandbox::container_labels;
use crate::transport::{
    ContainerStreamHeader, ExecRequest, ExecResult, FrameByteReader, FramedReader, RpcClient,
    RpcReader, RpcWriter,
};
use crate::utils::errors::{RelayError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::WriteHalf;
use tracing::{debug, info, warn};

type DriverClient = RpcClient<FrameByteReader, WriteHalf<AttachedStream>>;

/// Container environment settings shared by every bundle
#[derive(Debug, Clone)]
pub struct ContainerTemplate {
    /// Relay ID used in container names and labels
    pub relay_id: String,

    /// Driver executable inside bundle images
    pub driver_path: String,
}

/// A running bundle container with an attached driver
pub struct ContainerEnvironment {
    id: String,
    container_id: String,
    bundle: Arc<Bundle>,
    client: DriverClient,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerEnvironment {
    /// Pull the bundle image if needed, then create, attach and start a
    /// container. A container that fails part-way is removed.
    pub async fn create(
        id: String,
        bundle: Arc<Bundle>,
        runtime: Arc<dyn ContainerRuntime>,
        template: &ContainerTemplate,
    ) -> Result<Self> {
        let image = bundle.image_ref().ok_or_else(|| {
            RelayError::EnvironmentCreation(format!("bundle '{}' declares no image", bundle.name))
        })?;

        runtime.ensure_image(&image).await?;

        let spec = ContainerSpec {
            name: format!("{}-{}-{}", template.relay_id, bundle.name, id.to_lowercase()),
            image,
            cmd: vec![template.driver_path.clone()],
            env: vec![format!("COG_BUNDLE={}", bundle.name)],
            labels: container_labels(&template.relay_id, &bundle.name),
        };
        let container_id = runtime.create(&spec).await?;

        let stream = match Self::attach_and_start(runtime.as_ref(), &container_id).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(cleanup) = runtime.remove(&container_id).await {
                    warn!("Removing failed container {}: {}", container_id, cleanup);
                }
                return Err(e);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let results = FramedReader::new(read_half, ContainerStreamHeader::stdout()).into_async_read();
        let client = RpcClient::new(RpcReader::new(results), RpcWriter::new(write_half));

        info!("Started container {} for {}", spec.name, bundle.name);
        Ok(Self {
            id,
            container_id,
            bundle,
            client,
            runtime,
        })
    }

    async fn attach_and_start(runtime: &dyn ContainerRuntime, container_id: &str) -> Result<AttachedStream> {
        let stream = runtime.attach(container_id).await?;
        runtime.start(container_id).await?;
        Ok(stream)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn bundle(&self) -> &Arc<Bundle> {
        &self.bundle
    }

    /// Run one request through the driver
    pub async fn execute(&mut self, request: ExecRequest, timeout: Duration) -> Result<ExecResult> {
        debug!("Executing {} in container {}", request.executable, self.container_id);
        self.client.call(&request, Some(timeout)).await
    }

    /// Ask the driver to exit, then stop and remove the container.
    ///
    /// Removal is attempted even when stopping fails; the first error wins.
    pub async fn terminate(mut self) -> Result<()> {
        if let Err(e) = self.client.send_die().await {
            debug!("Driver in {} did not take die request: {}", self.container_id, e);
        }
        let stopped = self.runtime.stop(&self.container_id).await;
        if let Err(e) = &stopped {
            warn!("Stopping container {} failed: {}", self.container_id, e);
        }
        let removed = self.runtime.remove(&self.container_id).await;
        stopped?;
        removed?;
        debug!("Removed container {}", self.container_id);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory container runtime with a scripted driver on the far end.

    use super::*;
    use crate::transport::HeaderGenerator;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use parking_lot::Mutex;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// Records lifecycle calls; `attach` hands back a duplex stream served
    /// by [`serve_driver`]
    #[derive(Default)]
    pub struct FakeRuntime {
        pub calls: Mutex<Vec<String>>,
        pub fail_start: bool,
        pub fail_stop: bool,
    }

    impl FakeRuntime {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn ensure_image(&self, image: &str) -> Result<()> {
            self.record(format!("ensure_image {}", image));
            Ok(())
        }

        async fn create(&self, spec: &ContainerSpec) -> Result<String> {
            self.record(format!("create {}", spec.image));
            Ok(format!("ctr-{}", spec.name))
        }

        async fn start(&self, id: &str) -> Result<()> {
            self.record(format!("start {}", id));
            if self.fail_start {
                return Err(RelayError::EnvironmentCreation("start refused".into()));
            }
            Ok(())
        }

        async fn attach(&self, id: &str) -> Result<AttachedStream> {
            self.record(format!("attach {}", id));
            let (relay_end, driver_end) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve_driver(driver_end));
            Ok(Box::new(relay_end))
        }

        async fn stop(&self, id: &str) -> Result<()> {
            self.record(format!("stop {}", id));
            if self.fail_stop {
                return Err(RelayError::Container(
                    bollard::errors::Error::DockerResponseServerError {
                        status_code: 500,
                        message: "engine unavailable".into(),
                    },
                ));
            }
            Ok(())
        }

        async fn remove(&self, id: &str) -> Result<()> {
            self.record(format!("remove {}", id));
            Ok(())
        }
    }

    /// Answer each request with its executable echoed on stdout, framed the
    /// way the engine multiplexes a non-TTY attach stream. Every answer is
    /// preceded by a stderr frame the relay has to skip.
    async fn serve_driver(stream: DuplexStream) {
        let (read_half, mut out) = tokio::io::split(stream);
        let mut requests = RpcReader::new(read_half);

        while let Ok(request) = requests.read_message::<ExecRequest>().await {
            if request.die {
                break;
            }
            let result = ExecResult {
                stdout: format!("ran {}\n", request.executable).into_bytes(),
                stderr: vec![],
                success: true,
                elapsed_ms: 1,
            };

            let mut encoded = RpcWriter::new(Vec::new());
            if encoded.send(&result).await.is_err() {
                break;
            }
            let circuit = encoded.into_inner();
            let Ok(frames) = multiplex(b"driver: handling request\n", &circuit) else {
                break;
            };
            if out.write_all(&frames).await.is_err() {
                break;
            }
        }
    }

    fn multiplex(stderr: &[u8], stdout: &[u8]) -> Result<BytesMut> {
        let mut frames = BytesMut::new();
        ContainerStreamHeader::stderr().generate(stderr.len(), &mut frames)?;
        frames.extend_from_slice(stderr);
        ContainerStreamHeader::stdout().generate(stdout.len(), &mut frames)?;
        frames.extend_from_slice(stdout);
        Ok(frames)
    }
}
