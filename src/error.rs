//! Error types for the fleet supervisor
//!
//! Startup and registration failures are fatal and bubble up to `main`.
//! Failures while monitoring are contained per backend and only logged.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while managing a supervised OS process
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Creating a log/run/data directory failed
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The executable could not be resolved on the search path
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    /// The OS refused to spawn the command
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The PID file exists but could not be read
    #[error("failed to read PID file {}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The PID file does not contain a usable process id
    #[error("invalid PID '{contents}' in {}", path.display())]
    InvalidPid { path: PathBuf, contents: String },

    /// Delivering a signal to the process failed
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while rendering the load balancer configuration
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to read template {}: {source}", path.display())]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template error on line {line}: {message}")]
    TemplateRender { line: usize, message: String },

    #[error("failed to write config {}: {source}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the load balancer supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The requested operation is not valid in the current state
    #[error("cannot {operation} load balancer while {from}")]
    IllegalTransition {
        from: crate::loadbalancer::BalancerState,
        operation: &'static str,
    },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Errors raised while loading the backend inventory
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("inventory returned HTTP {0}")]
    Status(u16),

    #[error("invalid inventory response: {0}")]
    Fetch(String),

    #[error("cannot encode credential: {0}")]
    Encoding(String),
}

/// Errors raised while preparing a backend probe
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid proxy endpoint {endpoint}: {source}")]
    Client {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
}

pub type ServiceResult<T> = Result<T, ServiceError>;
pub type SupervisorResult<T> = Result<T, SupervisorError>;
