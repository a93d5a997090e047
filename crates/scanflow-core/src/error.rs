//! Error types for external collaborators

use scanflow_common::ScanflowError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Registration of {moving} failed (exit status {status:?}): {stderr}")]
    Registration {
        moving: PathBuf,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Tool '{tool}' failed (exit status {status:?}): {stderr}")]
    ToolFailed {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Expected output missing: {0}")]
    MissingOutput(PathBuf),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation not supported by this adapter: {0}")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<AdapterError> for ScanflowError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Registration { .. } => ScanflowError::Registration(err.to_string()),
            AdapterError::MissingOutput(_) => ScanflowError::Registration(err.to_string()),
            AdapterError::Io(io) => ScanflowError::Io(io),
            other => ScanflowError::TaskFailed(other.to_string()),
        }
    }
}
