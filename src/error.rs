//! Error types for the beanpoll agent.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the agent lifecycle and its collaborators.
#[derive(Debug, Error)]
pub enum AgentError {
    /// `start()` called while the agent is not stopped.
    #[error("agent already started")]
    AlreadyStarted,

    /// `stop()` called while the agent is not running.
    #[error("agent already stopped")]
    AlreadyStopped,

    /// An operation that requires a running agent was called in another state.
    #[error("agent is not running")]
    NotRunning,

    /// Shutdown finished, but one or more teardown steps failed.
    #[error("shutdown completed with errors: {0}")]
    Shutdown(String),

    /// A configuration file could not be read or parsed.
    #[error("configuration error in {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    /// The configured path does not exist or yields no usable files.
    #[error("configuration error: {0}")]
    Config(String),

    /// A writer rejected a `(server, query)` pairing during validation.
    #[error("writer validation failed for {server} / {query}: {message}")]
    Validation {
        server: String,
        query: String,
        message: String,
    },

    /// A writer failed to start.
    #[error("failed to start writer for {server}: {message}")]
    WriterStart { server: String, message: String },

    /// The scheduler refused a job.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
