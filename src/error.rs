//! Error types for framepipe.

use thiserror::Error;

/// Errors that decide the process exit code. Per-connection and per-file
/// failures stay inside the pipeline (retried or surfaced in the summary)
/// and never take the process down.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransferError>;
