/// Execution Orchestrator - one-shot staged runs
///
/// **State machine per execution:**
/// queued -> running -> { completed | timeout | error }
///
/// The orchestrator full-stages the project into an execution-scoped
/// ephemeral directory, spawns the sandboxed process, streams output to the
/// live channel while accumulating a bounded copy for the record, enforces
/// the wall-clock deadline, and tears the staging directory down
/// unconditionally. It is the sole writer of status/output/exit_code fields
/// while a run is in flight.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dockyard_common::blob::BlobStore;
use dockyard_common::error::ExecError;
use dockyard_common::redis as dyredis;
use dockyard_common::types::{
    ExecutionRecord, ExecutionStatus, OutputEvent, RunRequest, StreamKind, MAX_CAPTURED_OUTPUT,
};
use redis::aio::ConnectionManager;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::ToolchainManager;
use crate::runner::{OutputChunk, SandboxRunner, SandboxSpec};
use crate::staging;

/// Transient handle for an in-flight execution. Never persisted; an
/// execution interrupted by a worker restart is orphaned and treated as
/// failed, not resumed.
#[derive(Debug, Clone)]
struct ActiveExecution {
    owner_id: String,
    container_id: String,
}

/// Concurrency-safe registry of active executions, scoped to one
/// orchestrator instance. Exposes only id-keyed insert/remove/lookup.
#[derive(Clone, Default)]
struct ExecutionRegistry {
    inner: Arc<Mutex<HashMap<Uuid, ActiveExecution>>>,
}

impl ExecutionRegistry {
    fn insert(&self, id: Uuid, active: ActiveExecution) {
        let previous = self.inner.lock().unwrap().insert(id, active);
        if let Some(previous) = previous {
            // A replayed queue message; the newest container is the live
            // one, but the collision itself means something upstream is off.
            warn!(
                execution_id = %id,
                stale_container = %previous.container_id,
                "duplicate active execution id, replacing stale handle"
            );
        }
    }

    fn remove(&self, id: &Uuid) {
        self.inner.lock().unwrap().remove(id);
    }

    fn lookup(&self, id: &Uuid) -> Option<ActiveExecution> {
        self.inner.lock().unwrap().get(id).cloned()
    }
}

/// Output accumulator bounded to the first N characters; everything past the
/// bound is still streamed live, just not persisted.
struct BoundedBuffer {
    buf: String,
    remaining: usize,
}

impl BoundedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            remaining: limit,
        }
    }

    fn push(&mut self, chunk: &str) {
        if self.remaining == 0 {
            return;
        }
        for c in chunk.chars().take(self.remaining) {
            self.buf.push(c);
        }
        self.remaining = self.remaining.saturating_sub(chunk.chars().count());
    }

    fn into_string(self) -> String {
        self.buf
    }
}

pub struct Orchestrator {
    store: Arc<dyn BlobStore>,
    runner: SandboxRunner,
    toolchains: ToolchainManager,
    registry: ExecutionRegistry,
    staging_root: PathBuf,
    /// Grace period between SIGTERM and SIGKILL on timeout/cancel.
    grace: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn BlobStore>,
        runner: SandboxRunner,
        toolchains: ToolchainManager,
        staging_root: PathBuf,
    ) -> Self {
        Self {
            store,
            runner,
            toolchains,
            registry: ExecutionRegistry::default(),
            staging_root,
            grace: Duration::from_secs(2),
        }
    }

    /// Run one request end to end and return its final record.
    ///
    /// Staging and spawn failures are converted into a terminal `error`
    /// status here, never left dangling: whatever happened, the final record
    /// is persisted and the terminal status event is the last event
    /// published for the execution.
    #[instrument(skip(self, conn, request), fields(execution_id = %request.id, language = %request.language))]
    pub async fn run(
        &self,
        conn: &mut ConnectionManager,
        request: &RunRequest,
    ) -> Result<ExecutionRecord, ExecError> {
        let toolchain = self
            .toolchains
            .get(&request.language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(request.language.clone()))?
            .clone();

        let mut record = ExecutionRecord::queued(request);
        persist(conn, &record).await;

        let staging_dir = self.staging_root.join(request.id.to_string());
        let outcome = self
            .run_inner(conn, request, &toolchain, &staging_dir, &mut record)
            .await;

        // Cleanup always runs, regardless of which terminal state was
        // reached or how run_inner unwound.
        self.registry.remove(&request.id);
        match tokio::fs::remove_dir_all(&staging_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %staging_dir.display(), error = %e, "failed to delete staging dir"),
        }

        if let Err(e) = outcome {
            warn!(error = %e, "execution failed before completion");
            record.status = ExecutionStatus::Error;
            if !record.stderr.is_empty() {
                record.stderr.push('\n');
            }
            record.stderr.push_str(&e.to_string());
        }

        persist(conn, &record).await;
        publish(conn, OutputEvent::status(record.id, record.status)).await;

        info!(
            status = %record.status,
            exit_code = ?record.exit_code,
            duration_ms = record.duration_ms,
            "execution finished"
        );
        Ok(record)
    }

    async fn run_inner(
        &self,
        conn: &mut ConnectionManager,
        request: &RunRequest,
        toolchain: &crate::config::Toolchain,
        staging_dir: &PathBuf,
        record: &mut ExecutionRecord,
    ) -> Result<(), ExecError> {
        // A cancel can land while the request is still queued; honor it
        // before paying for a stage.
        if cancelled(conn, &request.id).await {
            record.status = ExecutionStatus::Error;
            record.stderr.push_str("[Stopped by user]");
            return Ok(());
        }

        tokio::fs::create_dir_all(staging_dir)
            .await
            .map_err(|e| {
                ExecError::Staging(dockyard_common::error::SyncError::io(
                    staging_dir.display().to_string(),
                    e,
                ))
            })?;

        let staged = staging::stage_full(
            &self.store,
            &request.owner_id,
            &request.project_id,
            staging_dir,
            &request.file_path,
        )
        .await?;
        debug!(staged, "project staged");

        let shell_command = toolchain.build_shell_command(&request.file_path)?;
        let spec = SandboxSpec {
            image: toolchain.image.clone(),
            shell_command,
            mount_dir: staging_dir.clone(),
            memory_limit_mb: toolchain.memory_limit_mb,
            cpu_limit: toolchain.cpu_limit,
            stdin: request.stdin.clone(),
        };

        let container_name = format!("dockyard-{}", request.id);
        let mut process = self
            .runner
            .spawn(&container_name, &spec)
            .await
            .map_err(|e| ExecError::ProcessSpawn(e.to_string()))?;

        // Registered before the first byte can arrive, so a cancel issued
        // mid-stream always finds its process.
        self.registry.insert(
            request.id,
            ActiveExecution {
                owner_id: request.owner_id.clone(),
                container_id: process.container_id.clone(),
            },
        );

        record.status = ExecutionStatus::Running;
        persist(conn, record).await;

        let started = std::time::Instant::now();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(toolchain.timeout_ms);
        let mut stdout = BoundedBuffer::new(MAX_CAPTURED_OUTPUT);
        let mut stderr = BoundedBuffer::new(MAX_CAPTURED_OUTPUT);
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline, process.next_chunk()).await {
                Ok(Some(chunk)) => {
                    let (kind, payload) = match &chunk {
                        OutputChunk::Stdout(s) => (StreamKind::Stdout, s.as_str()),
                        OutputChunk::Stderr(s) => (StreamKind::Stderr, s.as_str()),
                    };
                    // Forwarded immediately, then accumulated (bounded).
                    publish(conn, OutputEvent::chunk(request.id, kind, payload)).await;
                    match kind {
                        StreamKind::Stdout => stdout.push(payload),
                        StreamKind::Stderr => stderr.push(payload),
                        StreamKind::Status => unreachable!(),
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let exit_code = if timed_out {
            process.terminate(self.grace).await;
            None
        } else {
            // Streams are closed; the exit report is still bounded by the
            // deadline plus the kill grace.
            match tokio::time::timeout_at(deadline + self.grace, process.wait()).await {
                Ok(code) => code,
                Err(_) => {
                    timed_out = true;
                    process.terminate(self.grace).await;
                    None
                }
            }
        };

        record.duration_ms = started.elapsed().as_millis() as u64;
        record.exit_code = exit_code;
        record.stdout = stdout.into_string();
        record.stderr = stderr.into_string();

        if cancelled(conn, &request.id).await {
            // A cancel can race the deadline; the owner's intent wins.
            record.status = ExecutionStatus::Error;
            record.stderr.push_str("\n[Stopped by user]");
        } else if timed_out {
            record.status = ExecutionStatus::Timeout;
            // Trailer appended to whatever was captured, never replacing it.
            record.stderr.push_str(&format!(
                "\n[Execution timed out after {}ms]",
                toolchain.timeout_ms
            ));
        } else {
            match exit_code {
                Some(0) => record.status = ExecutionStatus::Completed,
                Some(code) => {
                    record.status = ExecutionStatus::Error;
                    if code == 137 {
                        record
                            .stderr
                            .push_str("\n[Process killed: likely exceeded the memory limit]");
                    }
                }
                None => {
                    record.status = ExecutionStatus::Error;
                    record.stderr.push_str("\n[No exit code reported]");
                }
            }
        }
        Ok(())
    }

    /// Cancel an in-flight execution on behalf of `requester_id`.
    ///
    /// Best effort past authorization: the SIGTERM is fired without waiting
    /// for the process to die; the run task observes the cancellation flag
    /// when the process closes and marks the record accordingly.
    pub async fn cancel(
        &self,
        conn: &mut ConnectionManager,
        execution_id: Uuid,
        requester_id: &str,
    ) -> Result<(), ExecError> {
        let container_id = self.authorize_cancel(execution_id, requester_id)?;

        if let Err(e) = dyredis::request_cancel(conn, &execution_id).await {
            warn!(execution_id = %execution_id, error = %e, "failed to set cancellation flag");
        }
        if let Err(e) = self.runner.signal(&container_id, "SIGTERM").await {
            debug!(execution_id = %execution_id, error = %e, "cancel signal failed (may have exited)");
        }

        // Same graceful-then-forceful semantics as the timeout path: a
        // process that ignores SIGTERM gets SIGKILL once the grace elapses.
        let runner = self.runner.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = runner.signal(&container_id, "SIGKILL").await {
                debug!(container_id = %container_id, error = %e, "SIGKILL after cancel failed (already exited)");
            }
        });

        info!(execution_id = %execution_id, "cancellation requested");
        Ok(())
    }

    /// Only the owning user may cancel; unknown ids are reported as such.
    fn authorize_cancel(&self, execution_id: Uuid, requester_id: &str) -> Result<String, ExecError> {
        let active = self
            .registry
            .lookup(&execution_id)
            .ok_or(ExecError::NotFound(execution_id))?;
        if active.owner_id != requester_id {
            return Err(ExecError::Forbidden(execution_id));
        }
        Ok(active.container_id)
    }
}

async fn persist(conn: &mut ConnectionManager, record: &ExecutionRecord) {
    if let Err(e) = dyredis::store_record(conn, record).await {
        warn!(execution_id = %record.id, error = %e, "failed to persist execution record");
    }
}

async fn publish(conn: &mut ConnectionManager, event: OutputEvent) {
    if let Err(e) = dyredis::publish_event(conn, &event).await {
        warn!(execution_id = %event.execution_id, error = %e, "failed to publish output event");
    }
}

async fn cancelled(conn: &mut ConnectionManager, execution_id: &Uuid) -> bool {
    match dyredis::is_cancelled(conn, execution_id).await {
        Ok(flag) => flag,
        Err(e) => {
            // Err on the side of keeping the run alive.
            warn!(execution_id = %execution_id, error = %e, "failed to check cancellation flag");
            false
        }
    }
}
