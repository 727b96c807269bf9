//! Engine error types

use crate::resource::ResourceId;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Dependency cycle detected: {}", format_path(.path))]
    CycleDetected { path: Vec<ResourceId> },

    #[error("Duplicate resource identity: {0}")]
    DuplicateIdentity(ResourceId),

    #[error("{from} references {to}, which is not declared")]
    DanglingReference { from: ResourceId, to: ResourceId },

    #[error("Invalid declaration: {0}")]
    InvalidDeclaration(String),

    #[error("State is locked by {holder} since {acquired_at} (lease expires {expires_at})")]
    LockHeld {
        holder: String,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },

    #[error("State lock is no longer held by {0}")]
    LockLost(String),

    #[error("Version conflict on {id}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        id: ResourceId,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Resource not found in state: {0}")]
    NotFound(ResourceId),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Unresolved reference from {from} to {to}.{output}")]
    UnresolvedReference {
        from: ResourceId,
        to: ResourceId,
        output: String,
    },

    #[error("Apply finished with errors: {failed} failed, {skipped} skipped")]
    PartialFailure { failed: usize, skipped: usize },

    #[error("State file error: {0}")]
    StateError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error reported by a provider call
///
/// Providers classify every failure: `retryable` errors (rate limiting,
/// throttling, timeouts) go through the retry policy, everything else is
/// fatal for the entry on the first occurrence.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Remote error: {message}")]
pub struct RemoteError {
    pub message: String,

    pub retryable: bool,

    /// Attributes known about a half-finished remote object, if any
    pub partial: Option<crate::resource::Attributes>,
}

impl RemoteError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            partial: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            partial: None,
        }
    }

    pub fn with_partial(mut self, partial: crate::resource::Attributes) -> Self {
        self.partial = Some(partial);
        self
    }
}

fn format_path(path: &[ResourceId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_shows_full_path() {
        let a = ResourceId::new("application", "a");
        let b = ResourceId::new("federated_credential", "b");
        let err = EngineError::CycleDetected {
            path: vec![a.clone(), b, a],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected: application.a -> federated_credential.b -> application.a"
        );
    }

    #[test]
    fn test_remote_error_from_conversion() {
        let err: EngineError = RemoteError::retryable("429 Too Many Requests").into();
        assert!(matches!(err, EngineError::Remote(ref r) if r.retryable));
        assert!(err.to_string().contains("429"));
    }
}
