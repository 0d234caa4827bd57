use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing descriptor, process, marker or remote data.
    #[error("not found: {0}")]
    NotFound(String),

    /// The descriptor lock was not acquired within the bounded wait.
    #[error("timed out after {}s waiting for lock {}", .timeout.as_secs(), .path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// Another remote sync for the same experiment is in flight.
    #[error("remote storage is locked for experiment {workspace_id}/{experiment_id}")]
    RemoteStorageLocked {
        workspace_id: String,
        experiment_id: String,
    },

    #[error("malformed experiment config {}: {reason}", .path.display())]
    MalformedConfig { path: PathBuf, reason: String },

    #[error("remote operation failed: {0}")]
    RemoteOperation(String),

    /// A multi-item copy failed; every copy created before the failure was removed.
    #[error("failed to copy experiment {failed_id}: {reason} (cleaned up: {})", .cleaned_up.join(", "))]
    CopyFailed {
        failed_id: String,
        cleaned_up: Vec<String>,
        reason: String,
    },

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn is_locked(&self) -> bool {
        matches!(self, Error::RemoteStorageLocked { .. })
    }

    /// Status code the HTTP layer reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::RemoteStorageLocked { .. } => 423,
            Error::LockTimeout { .. } => 503,
            _ => 500,
        }
    }

    /// Stable machine-readable code used in JSON error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::LockTimeout { .. } => "lock_timeout",
            Error::RemoteStorageLocked { .. } => "remote_storage_locked",
            Error::MalformedConfig { .. } => "malformed_config",
            Error::RemoteOperation(_) => "remote_operation_failed",
            Error::CopyFailed { .. } => "copy_failed",
            Error::Settings(_) => "invalid_settings",
            Error::Io(_) | Error::Yaml(_) | Error::Json(_) => "internal_error",
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            other => Error::RemoteOperation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_contention_maps_to_locked_status() {
        let err = Error::RemoteStorageLocked {
            workspace_id: "ws".to_string(),
            experiment_id: "e1".to_string(),
        };
        assert!(err.is_locked());
        assert_eq!(err.http_status(), 423);
        assert_eq!(err.code(), "remote_storage_locked");
    }

    #[test]
    fn copy_failure_reports_cleaned_ids() {
        let err = Error::CopyFailed {
            failed_id: "b".to_string(),
            cleaned_up: vec!["x1".to_string(), "x2".to_string()],
            reason: "boom".to_string(),
        };
        assert_eq!(err.http_status(), 500);
        assert!(err.to_string().contains("x1, x2"));
    }
}
