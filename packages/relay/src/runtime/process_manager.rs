// packages/relay/src/runtime/process_manager.rs
//! Process manager for running bundle executables
//!
//! Used by native environments on the relay host and by the driver inside
//! containers. Each run spawns one process with:
//! - a cleared environment (plus `PATH`, `HOME`, `LANG`) and the calling env
//! - piped stdin fed with the request context
//! - stdout/stderr captured in full
//! - its own process group
//! - a deadline, after which the whole group is terminated

use crate::utils::errors::{RelayError, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Host variables passed through the cleared environment
const INHERITED_VARS: &[&str] = &["PATH", "HOME", "LANG"];

/// Time between SIGTERM and SIGKILL for an overrunning process
const KILL_GRACE: Duration = Duration::from_secs(2);

const TERMINATE_POLL: Duration = Duration::from_millis(50);

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Executable to run
    pub executable: PathBuf,

    /// Process arguments
    pub args: Vec<String>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Environment variables
    pub env_vars: Vec<(String, String)>,

    /// Bytes written to stdin before it is closed
    pub stdin: Vec<u8>,

    /// Execution timeout
    pub timeout: Duration,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            args: vec![],
            work_dir: None,
            env_vars: vec![],
            stdin: vec![],
            timeout: Duration::from_secs(60),
        }
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

/// Process manager for spawning bundle executables
#[derive(Debug, Clone, Default)]
pub struct ProcessManager;

impl ProcessManager {
    /// Create a new process manager
    pub fn new() -> Self {
        Self
    }

    /// Spawn a new process with piped stdio
    pub fn spawn(&self, config: &SpawnConfig) -> Result<Child> {
        debug!("Spawning process: {:?}", config.executable);

        let mut command = Command::new(&config.executable);
        command.args(&config.args);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }

        command.env_clear();
        for key in INHERITED_VARS {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        command
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            RelayError::ProcessSpawnFailed(format!(
                "failed to spawn {}: {}",
                config.executable.display(),
                e
            ))
        })?;

        debug!("Process spawned with PID: {:?}", child.id());
        Ok(child)
    }

    /// Run a process to completion and capture its output
    ///
    /// The deadline covers both the exit and the end of output, so a
    /// background child still holding a pipe cannot outlive it.
    pub async fn run(&self, config: SpawnConfig) -> Result<ProcessOutput> {
        let started = Instant::now();
        let mut child = self.spawn(&config)?;
        // Leader of its own process group
        let group = child.id();

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::ProcessSpawnFailed("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RelayError::ProcessSpawnFailed("failed to capture stderr".into()))?;

        let input = config.stdin;
        let mut writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&input).await {
                    // Commands that ignore stdin may exit before reading it
                    debug!("stdin not fully consumed: {}", e);
                }
            }
        });
        let mut stdout_task = collect(stdout);
        let mut stderr_task = collect(stderr);

        let finished = tokio::time::timeout(config.timeout, async {
            let status = child.wait().await?;
            let stdout = join_output(&mut stdout_task).await?;
            let stderr = join_output(&mut stderr_task).await?;
            let _ = (&mut writer).await;
            Ok::<_, RelayError>((status, stdout, stderr))
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "{} exceeded {:?}, terminating",
                    config.executable.display(),
                    config.timeout
                );
                if let Some(group) = group {
                    self.terminate_group(group, &mut child).await?;
                }
                let _ = child.wait().await;
                writer.abort();
                stdout_task.abort();
                stderr_task.abort();
                return Err(RelayError::Timeout(format!(
                    "{} did not finish within {:?}",
                    config.executable.display(),
                    config.timeout
                )));
            }
        };

        Ok(ProcessOutput {
            stdout,
            stderr,
            success: status.success(),
            exit_code: status.code(),
            elapsed: started.elapsed(),
        })
    }

    /// Terminate a process group: SIGTERM, then SIGKILL once the grace
    /// period runs out. `leader` is reaped while waiting.
    async fn terminate_group(&self, group: u32, leader: &mut Child) -> Result<()> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let group = Pid::from_raw(group as i32);

        debug!("Sending SIGTERM to process group {}", group);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            // Already gone
            debug!("SIGTERM to group {} failed: {}", group, e);
            return Ok(());
        }

        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            let _ = leader.try_wait();
            if killpg(group, None).is_err() {
                return Ok(());
            }
            tokio::time::sleep(TERMINATE_POLL).await;
        }

        debug!("Process group {} still alive, sending SIGKILL", group);
        match killpg(group, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(RelayError::ProcessSpawnFailed(format!(
                "failed to send SIGKILL: {}",
                e
            ))),
        }
    }
}

fn collect<R>(mut pipe: R) -> JoinHandle<std::io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

async fn join_output(task: &mut JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>> {
    task.await
        .map_err(|e| RelayError::ProcessSpawnFailed(format!("output reader failed: {}", e)))?
        .map_err(RelayError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> SpawnConfig {
        SpawnConfig {
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let output = ProcessManager::new()
            .run(sh("echo out; echo err 1>&2"))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_run_feeds_stdin_and_env() {
        let mut config = sh("cat; printf \"$COG_BUNDLE\"");
        config.stdin = b"{\"room\":\"ops\"}\n".to_vec();
        config.env_vars = vec![("COG_BUNDLE".into(), "echo".into())];

        let output = ProcessManager::new().run(config).await.unwrap();
        assert_eq!(output.stdout, b"{\"room\":\"ops\"}\necho");
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("RELAY_TEST_LEAK", "leaked");
        let output = ProcessManager::new()
            .run(sh("printf \"${RELAY_TEST_LEAK:-clean}\""))
            .await
            .unwrap();
        assert_eq!(output.stdout, b"clean");
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let output = ProcessManager::new().run(sh("exit 3")).await.unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let config = SpawnConfig {
            executable: PathBuf::from("/nonexistent/bin/tool"),
            ..Default::default()
        };
        let result = ProcessManager::new().run(config).await;
        assert!(matches!(result, Err(RelayError::ProcessSpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let mut config = sh("sleep 30");
        config.timeout = Duration::from_millis(100);
        let started = Instant::now();
        let result = ProcessManager::new().run(config).await;
        assert!(matches!(result, Err(RelayError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_background_child_cannot_outlive_deadline() {
        let mut config = sh("sleep 30 & echo started");
        config.timeout = Duration::from_millis(500);
        let started = Instant::now();
        let result = ProcessManager::new().run(config).await;
        assert!(matches!(result, Err(RelayError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
