use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced by the execution orchestrator.
///
/// `Timeout` and owner-cancellation are not modeled here: they are terminal
/// execution statuses, not errors returned to the caller.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("staging failed: {0}")]
    Staging(#[from] SyncError),

    #[error("failed to spawn sandbox process: {0}")]
    ProcessSpawn(String),

    #[error("no active execution with id {0}")]
    NotFound(Uuid),

    #[error("execution {0} is not owned by the requester")]
    Forbidden(Uuid),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures surfaced by staging and workspace sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("blob store error: {0}")]
    Store(String),

    #[error("target file '{0}' is missing from the project")]
    MissingTarget(String),

    #[error("'{path}' still locked after {attempts} attempts")]
    LockedFileRetryExhausted { path: String, attempts: u32 },

    #[error("'{0}' escapes the workspace root")]
    PathEscape(String),

    #[error("io error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        SyncError::Store(err.to_string())
    }
}
