/// Isolated Process Runner - sandboxed subprocess execution
///
/// **Core Responsibility:**
/// Launch one command inside a locked-down container and hand its output
/// back as an incremental stream.
///
/// **Isolation rules:**
/// - Network disabled
/// - Memory and CPU limits enforced per toolchain
/// - Staging directory bind-mounted read-only at /workspace
/// - Stdin delivered over the container attach stream, never via the
///   command line
/// - Container removal guaranteed by a drop guard, even on panic or
///   cancellation
use std::path::PathBuf;
use std::pin::Pin;

use anyhow::{Context, Result};
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, KillContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::WORKSPACE_MOUNT;

/// Everything the runner needs to launch one sandboxed command.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    pub shell_command: String,
    pub mount_dir: PathBuf,
    pub memory_limit_mb: u32,
    pub cpu_limit: f64,
    pub stdin: Option<String>,
}

/// One chunk of subprocess output, tagged with its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// Container cleanup guard - guarantees container removal on drop,
/// even if orchestration panics or the task is cancelled.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "failed to clean up container");
            }
        });
    }
}

#[derive(Clone)]
pub struct SandboxRunner {
    docker: Docker,
}

impl SandboxRunner {
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Ensure the toolchain image is available (pull if needed).
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "image cache hit");
            return Ok(());
        }

        warn!(image, "image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull sandbox image")?;
        }
        info!(image, "image pulled");
        Ok(())
    }

    /// Launch the spec's command in a fresh container and return a handle to
    /// the live process. Stdin (if any) is written to the attach stream
    /// before the container starts producing output, with a trailing newline
    /// appended when absent so line-reading programs do not hang.
    pub async fn spawn(&self, name: &str, spec: &SandboxSpec) -> Result<SandboxProcess> {
        self.ensure_image(&spec.image)
            .await
            .with_context(|| format!("image '{}' unavailable", spec.image))?;

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                spec.shell_command.clone(),
            ]),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(spec.stdin.is_some()),
            open_stdin: Some(spec.stdin.is_some()),
            stdin_once: Some(spec.stdin.is_some()),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(spec.memory_limit_mb as i64 * 1024 * 1024),
                nano_cpus: Some((spec.cpu_limit * 1_000_000_000.0) as i64),
                binds: Some(vec![format!(
                    "{}:{}:ro",
                    spec.mount_dir.display(),
                    WORKSPACE_MOUNT
                )]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name,
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create sandbox container")?;
        let container_id = container.id;

        // Guard goes up before anything can fail past this point.
        let guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container_id.clone(),
        };

        // Attach before start so the first output byte is never missed.
        let attach_options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stdin: Some(spec.stdin.is_some()),
            stream: Some(true),
            ..Default::default()
        };
        let attach = self
            .docker
            .attach_container(&container_id, Some(attach_options))
            .await
            .context("Failed to attach to sandbox container")?;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start sandbox container")?;

        let mut input = attach.input;
        if let Some(stdin) = &spec.stdin {
            let mut payload = stdin.clone();
            if !payload.ends_with('\n') {
                payload.push('\n');
            }
            // Best effort: a process that exits without reading its stdin
            // closes the pipe first, and that is not a launch failure.
            if let Err(e) = input.write_all(payload.as_bytes()).await {
                debug!(container_id = %container_id, error = %e, "stdin not consumed");
            }
            if let Err(e) = input.shutdown().await {
                debug!(container_id = %container_id, error = %e, "stdin close failed");
            }
        }

        Ok(SandboxProcess {
            docker: self.docker.clone(),
            container_id,
            output: attach.output,
            _guard: guard,
        })
    }

    /// Send a signal to a container by id. Used for cancellation, where the
    /// caller only holds the id from the active-execution registry.
    pub async fn signal(&self, container_id: &str, signal: &str) -> Result<()> {
        self.docker
            .kill_container(container_id, Some(KillContainerOptions { signal }))
            .await
            .with_context(|| format!("Failed to send {} to container", signal))
    }
}

/// Handle to one live sandboxed process.
pub struct SandboxProcess {
    docker: Docker,
    pub container_id: String,
    output: Pin<Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>,
    _guard: ContainerGuard,
}

impl SandboxProcess {
    /// Next output chunk, or None when both streams have closed.
    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        while let Some(item) = self.output.next().await {
            match item {
                Ok(LogOutput::StdOut { message }) => {
                    return Some(OutputChunk::Stdout(
                        String::from_utf8_lossy(&message).into_owned(),
                    ));
                }
                Ok(LogOutput::StdErr { message }) => {
                    return Some(OutputChunk::Stderr(
                        String::from_utf8_lossy(&message).into_owned(),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container_id = %self.container_id, error = %e, "error reading sandbox output");
                    return None;
                }
            }
        }
        None
    }

    /// Wait for the container to stop and report its exit code.
    pub async fn wait(&mut self) -> Option<i64> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(&self.container_id, Some(wait_options));
        match wait_stream.next().await {
            Some(Ok(response)) => Some(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                // Non-zero exits surface as a wait error carrying the code.
                Some(code)
            }
            Some(Err(e)) => {
                warn!(container_id = %self.container_id, error = %e, "failed to get exit code");
                None
            }
            None => None,
        }
    }

    /// Graceful-then-forceful termination: SIGTERM, a grace period, then
    /// SIGKILL if the process is still up. Best effort on both signals.
    pub async fn terminate(&mut self, grace: std::time::Duration) {
        if let Err(e) = self
            .docker
            .kill_container(&self.container_id, Some(KillContainerOptions { signal: "SIGTERM" }))
            .await
        {
            debug!(container_id = %self.container_id, error = %e, "SIGTERM failed (may have exited)");
        }

        let waited = tokio::time::timeout(grace, self.wait()).await;
        if waited.is_err() {
            warn!(container_id = %self.container_id, "grace period elapsed, sending SIGKILL");
            if let Err(e) = self
                .docker
                .kill_container(
                    &self.container_id,
                    Some(KillContainerOptions { signal: "SIGKILL" }),
                )
                .await
            {
                debug!(container_id = %self.container_id, error = %e, "SIGKILL failed (may have exited)");
            }
        }
    }
}
