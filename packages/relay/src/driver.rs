// packages/relay/src/driver.rs
//! In-container command driver
//!
//! The relay starts one driver per bundle container. The driver reads
//! circuit-framed CBOR [`ExecRequest`]s on stdin, runs each executable to
//! completion and answers with an [`ExecResult`] on stdout. A request with
//! `die` set, or the relay closing stdin, ends the loop.

use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
use crate::transport::{ExecRequest, ExecResult, RpcReader, RpcWriter};
use crate::utils::errors::{RelayError, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Upper bound on one command; the relay normally gives up first
pub const DRIVER_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Serve requests until told to stop. Returns how many were executed.
pub async fn serve<R, W>(input: R, output: W, timeout: Duration) -> Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = RpcReader::new(input);
    let mut results = RpcWriter::new(output);
    let processes = ProcessManager::new();
    let mut served = 0;

    loop {
        let request: ExecRequest = match requests.read_message().await {
            Ok(request) => request,
            Err(RelayError::StreamClosed) => {
                debug!("Relay closed the request stream");
                break;
            }
            Err(e) => return Err(e),
        };

        if request.die {
            info!("Driver asked to exit after {} requests", served);
            break;
        }

        let result = execute(&processes, request, timeout).await;
        results.send(&result).await?;
        served += 1;
    }

    Ok(served)
}

async fn execute(processes: &ProcessManager, request: ExecRequest, timeout: Duration) -> ExecResult {
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

    match processes.run(config).await {
        Ok(output) => ExecResult {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.success,
            elapsed_ms: output.elapsed.as_millis() as u64,
        },
        Err(e) => {
            warn!("Running {} failed: {}", request.executable, e);
            ExecResult {
                stdout: Vec::new(),
                stderr: e.to_string().into_bytes(),
                success: false,
                elapsed_ms: 0,
            }
        }
    }
}
