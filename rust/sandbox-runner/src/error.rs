use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by a hypervisor gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Domain '{0}' not found")]
    NotFound(String),

    #[error("Domain '{0}' is already defined")]
    AlreadyDefined(String),

    #[error("Requested memory {requested_kib} KiB exceeds domain maximum {max_kib} KiB")]
    MemoryAboveMaximum { requested_kib: u64, max_kib: u64 },

    #[error("Domain '{id}' is {state}, cannot {operation}")]
    InvalidState {
        id: String,
        state: String,
        operation: String,
    },

    /// Transient gateway failure (connection, RPC, guest agent)
    #[error("Hypervisor operation failed: {0}")]
    Operation(String),
}

/// Result type alias for gateway calls
pub type HypervisorResult<T> = Result<T, HypervisorError>;

/// Core error type for the sandbox runner
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    /// Caller supplied an unusable value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Memory {requested_kib} KiB outside allowed range [{min_kib}, {max_kib}] KiB")]
    MemoryOutOfBounds {
        requested_kib: u64,
        min_kib: u64,
        max_kib: u64,
    },

    #[error("Timed out after {waited_secs}s waiting for snapshot lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited_secs: u64 },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Pool state machine violations
    #[error("Pool VM '{name}' cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    #[error("Pool VM '{0}' is already tracked")]
    DuplicateVm(String),

    #[error("Pool VM '{0}' not found")]
    VmNotFound(String),

    /// Stats store / SQLite errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Snapshot transfer failed: {0}")]
    Snapshot(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for runner operations
pub type RunnerResult<T> = Result<T, RunnerError>;

impl From<rusqlite::Error> for RunnerError {
    fn from(err: rusqlite::Error) -> Self {
        RunnerError::Storage(err.to_string())
    }
}

impl From<serde_yaml::Error> for RunnerError {
    fn from(err: serde_yaml::Error) -> Self {
        RunnerError::Configuration(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RunnerError {
    fn from(err: tokio::task::JoinError) -> Self {
        RunnerError::Other(anyhow::anyhow!("background task failed: {err}"))
    }
}

impl HypervisorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound(_))
    }

    pub fn is_already_defined(&self) -> bool {
        matches!(self, HypervisorError::AlreadyDefined(_))
    }
}

impl RunnerError {
    /// True when the error means "the thing is gone", which callers treat as nothing to do
    pub fn is_not_found(&self) -> bool {
        match self {
            RunnerError::Hypervisor(e) => e.is_not_found(),
            RunnerError::VmNotFound(_) => true,
            _ => false,
        }
    }

    pub fn is_already_defined(&self) -> bool {
        matches!(self, RunnerError::Hypervisor(e) if e.is_already_defined())
    }

    pub fn invalid_transition(
        name: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        RunnerError::InvalidTransition {
            name: name.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
