//! Local provider error types

use driftflow_engine::{RemoteError, ResourceId};
use std::io::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocalProviderError {
    #[error("Unsupported resource type: {0}")]
    UnsupportedType(String),

    #[error("{resource_type} requires attribute '{attribute}'")]
    MissingAttribute {
        resource_type: String,
        attribute: &'static str,
    },

    #[error("Invalid resource address: {0}")]
    InvalidAddress(String),

    #[error("No object id recorded for {0}")]
    MissingObjectId(ResourceId),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LocalProviderError>;

impl LocalProviderError {
    /// Transient filesystem conditions are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            LocalProviderError::IoError(e) => matches!(
                e.kind(),
                ErrorKind::Interrupted
                    | ErrorKind::WouldBlock
                    | ErrorKind::TimedOut
                    | ErrorKind::ResourceBusy
            ),
            _ => false,
        }
    }
}

impl From<LocalProviderError> for RemoteError {
    fn from(err: LocalProviderError) -> Self {
        if err.is_retryable() {
            RemoteError::retryable(err.to_string())
        } else {
            RemoteError::fatal(err.to_string())
        }
    }
}
