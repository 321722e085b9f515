use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of characters retained per output stream on an execution
/// record. Anything beyond this is streamed live but not persisted.
pub const MAX_CAPTURED_OUTPUT: usize = 10_000;

/// A request to compile/run one file of a project inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub id: Uuid,
    pub owner_id: String,
    pub project_id: String,
    /// Path of the file to execute, relative to the project root.
    pub file_path: String,
    pub language: String,
    /// Optional payload fed to the subprocess's standard input.
    #[serde(default)]
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Timeout,
    Error,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Timeout | ExecutionStatus::Error
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Persistent record of one execution. The orchestrator is the sole writer
/// of status/output/exit_code fields while the run is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub project_id: String,
    pub file_path: String,
    pub language: String,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn queued(req: &RunRequest) -> Self {
        Self {
            id: req.id,
            owner_id: req.owner_id.clone(),
            project_id: req.project_id.clone(),
            file_path: req.file_path.clone(),
            language: req.language.clone(),
            status: ExecutionStatus::Queued,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    Status,
}

/// One event on the live output channel. Chunks are published in the order
/// the subprocess produced them on each stream; a `Status` event is always
/// the last event published for an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    pub execution_id: Uuid,
    pub kind: StreamKind,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputEvent {
    pub fn chunk(execution_id: Uuid, kind: StreamKind, payload: impl Into<String>) -> Self {
        Self {
            execution_id,
            kind,
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn status(execution_id: Uuid, status: ExecutionStatus) -> Self {
        Self::chunk(execution_id, StreamKind::Status, status.to_string())
    }
}

/// One row of a remote listing: a file or directory under a project prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Path relative to the project root, forward-slash separated.
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    /// Content fingerprint; empty for directories.
    pub fingerprint: String,
}
