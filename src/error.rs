//! Error types for the supervisor.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while supervising services.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration failed to parse or validate
    #[error("invalid configuration: {}: {reason}", path.display())]
    ConfigInvalid { path: PathBuf, reason: String },

    /// Dependency graph contains a cycle
    #[error("circular dependency between services: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// A depends_on entry names a service that does not exist
    #[error("service {service} depends on unknown service {dependency}")]
    UnknownDependency { service: String, dependency: String },

    /// Service not found in the roster
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Child process failed to spawn
    #[error("failed to spawn {service}: {source}")]
    SpawnFailed {
        service: String,
        #[source]
        source: std::io::Error,
    },

    /// Another supervisor instance already owns the app data home
    #[error("supervisor already running with pid {0}")]
    AlreadyRunning(u32),

    /// The supervisor is not running (status / stop requested against nothing)
    #[error("supervisor is not running")]
    NotRunning,

    /// Supervisor task is gone; command could not be delivered
    #[error("supervisor for {0} is no longer running")]
    SupervisorGone(String),

    /// Signal delivery failed
    #[error("failed to signal pid {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Process exit codes for the CLI surface.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const GENERIC: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const ALREADY_RUNNING: i32 = 3;
    pub const NOT_RUNNING: i32 = 4;
}

impl Error {
    /// Map an error to the documented CLI exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigInvalid { .. }
            | Error::DependencyCycle(_)
            | Error::UnknownDependency { .. } => exit_code::CONFIG,
            Error::AlreadyRunning(_) => exit_code::ALREADY_RUNNING,
            Error::NotRunning => exit_code::NOT_RUNNING,
            _ => exit_code::GENERIC,
        }
    }
}
