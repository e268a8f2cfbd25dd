//! Error types for the gene-family alignment pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by the external-tool driver (component B).
#[derive(Error, Debug)]
pub enum ToolError {
    /// The binary could not be found on `$PATH` or at the configured path.
    #[error("tool '{0}' not found or not executable")]
    NotFound(String),

    /// The binary could not be spawned (permission denied, exec format, ...).
    #[error("failed to launch '{name}': {source}")]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The version probe ran but its output did not contain a parseable
    /// version line.
    #[error("could not parse version output of '{0}'")]
    UnparseableVersion(String),

    /// I/O error while reading the tool's output file.
    #[error("I/O error reading tool output: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the family cache and its manifest (component C).
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error in cache directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("family file '{0}' has no entry in the cache")]
    UnknownFamily(String),
}

/// Errors raised by the bounded work queue (component D).
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("work queue is shut down")]
    ShutDown,
}

/// Errors raised by the progress store (component E).
#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("I/O error reading/writing progress file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("progress file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level error type surfaced by the pipeline coordinator.
///
/// Matches the error-kind table in the design: `ConfigMismatch`,
/// `InputMissing`, and `ToolLaunchError` are always fatal; the others are
/// recorded against the affected unit and the run continues.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Restarting with a different reference database or input-file
    /// checksum than the stored `params`.
    #[error(
        "configuration mismatch on restart\noriginal:\n{original}\ncurrent:\n{current}"
    )]
    ConfigMismatch { original: String, current: String },

    /// A configured input file could not be opened at startup.
    #[error("input file missing: {path} ({source}); re-specify inputs")]
    InputMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external tool binary could not be launched at all.
    #[error("tool launch failed: {0}")]
    ToolLaunchError(#[from] ToolError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with custom message, used sparingly for conditions
    /// that do not warrant a dedicated variant.
    #[error("{0}")]
    Other(String),
}
