//! Error types shared across the pipeline.

use std::io;

use thiserror::Error;

/// Errors surfaced by the acquisition pipeline.
///
/// `Config` and `Resource` are fatal at startup; `Transport` is retried and
/// then dropped by the uploader; `SyncInfeasible` downgrades the sync result
/// to null offsets without failing the run.
#[derive(Debug, Error)]
pub enum VoltaError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("log parse error: {0}")]
    Parse(String),

    #[error("sync infeasible: {0}")]
    SyncInfeasible(&'static str),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, VoltaError>;
