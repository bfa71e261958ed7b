//! Error types shared across the supervisor.

use std::fmt::{Display, Formatter};

/// Shared supervisor result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Supervisor error enumeration covering all checkpoint failure modes.
///
/// Errors are `Clone` so the outcome of a single checkpoint job can be
/// handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// A forwarded call to a real kernel session failed.
    Kernel(String),
    /// Requested object, session, or child does not exist.
    NotFound(String),
    /// A precondition of the checkpoint pass could not be located.
    MissingDependency(String),
    /// Quota or memory exhausted while allocating.
    ResourceExhausted(String),
    /// Operation is not permitted in the current orchestrator state.
    InvalidState(String),
    /// Checkpoint worker stopped or its job failed.
    Worker(String),
    /// IPC communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Kernel(msg) => write!(f, "kernel: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::MissingDependency(msg) => write!(f, "missing dependency: {msg}"),
            Self::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Worker(msg) => write!(f, "worker: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
