use thiserror::Error;

/// Crate-wide error type.
///
/// Subsystem-local error enums (`subprocess::ProcessError`) convert into
/// this one at their module boundary, the same flat-variant-plus-`#[from]`
/// shape used throughout this codebase.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("ambiguous session id {0:?}: matches {1} sessions")]
    AmbiguousSessionId(String, usize),

    #[error("failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("failed to terminate process: {0}")]
    ProcessKill(String),

    #[error("usage limit reached")]
    UsageLimit,

    #[error("context limit reached")]
    ContextLimit,

    #[error("iteration timed out after {0:?}")]
    IterationTimeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("process error: {0}")]
    Process(#[from] crate::subprocess::ProcessError),

    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
