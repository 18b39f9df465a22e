//! Error types for geoshard operations.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GeoshardError>;

/// Errors produced by geoshard operations.
///
/// Configuration and precondition errors abort a run before any data is
/// touched. I/O and format errors are fatal for the stage that hit them.
/// Dangling references inside the dataset are not represented here; they
/// are logged and skipped at the smallest possible granularity.
#[derive(Debug, Error)]
pub enum GeoshardError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("directory is not empty: {0}")]
    DirectoryNotEmpty(PathBuf),

    /// End of file in the middle of a record.
    #[error("unexpected end of file")]
    UnexpectedEof,

    /// A record or tree description that cannot be decoded.
    #[error("invalid data format")]
    InvalidFormat,

    #[error("invalid tree path code: {0}")]
    InvalidPathCode(String),

    /// Merge inputs violated the sorted per-kind contract, or the same
    /// `(kind, id)` appeared in more than one input.
    #[error("merge ordering violation: {0}")]
    MergeOrder(String),

    /// The write pipeline shut down because a consumer failed.
    #[error("write pipeline closed")]
    PipelineClosed,
}
