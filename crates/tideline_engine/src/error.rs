//! Error types for the sync engine.

use crate::transport::TransportFailure;
use serde_json::Value;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Persisted storage error.
    #[error("storage error: {0}")]
    Storage(#[from] tideline_storage::StorageError),

    /// A persisted record or index could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The remote store could not be reached (transport status 0 or offline).
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// The record was rejected before it reached any store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The remote store rejected the request.
    #[error("server rejected request with status {status}")]
    Server {
        /// Transport status code.
        status: u16,
        /// Raw failure payload.
        payload: Value,
    },

    /// The sync session stalled and was force-closed by the watchdog.
    #[error("sync session stalled and was closed")]
    StallTimeout,

    /// The sync session this operation was waiting on ended in failure.
    #[error("sync session failed: {0}")]
    SessionFailed(String),

    /// A single record was requested but is not stored.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The operation needs a record identity and none was set.
    #[error("record has no identity attribute `{0}`")]
    MissingIdentity(String),

    /// A background task panicked or was cancelled.
    #[error("background task aborted: {0}")]
    TaskAborted(String),
}

impl SyncError {
    /// Returns true if the failed work stays queued and will be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connectivity(_) | SyncError::StallTimeout | SyncError::SessionFailed(_)
        )
    }

    /// Returns true for connectivity failures.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Connectivity(_))
    }
}

impl From<TransportFailure> for SyncError {
    fn from(failure: TransportFailure) -> Self {
        if failure.is_connectivity() {
            SyncError::Connectivity(failure.to_string())
        } else {
            SyncError::Server {
                status: failure.status,
                payload: failure.body,
            }
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::TaskAborted(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::Connectivity("offline".into()).is_retryable());
        assert!(SyncError::StallTimeout.is_retryable());
        assert!(!SyncError::Validation("title required".into()).is_retryable());
        assert!(!SyncError::Server {
            status: 500,
            payload: Value::Null
        }
        .is_retryable());
    }

    #[test]
    fn transport_failure_classification() {
        let err: SyncError = TransportFailure::connectivity().into();
        assert!(err.is_connectivity());

        let err: SyncError = TransportFailure::new(422, json!({"error": "bad"})).into();
        match err {
            SyncError::Server { status, payload } => {
                assert_eq!(status, 422);
                assert_eq!(payload["error"], "bad");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_display() {
        let err = SyncError::MissingIdentity("id".into());
        assert_eq!(err.to_string(), "record has no identity attribute `id`");

        let err = SyncError::Server {
            status: 404,
            payload: Value::Null,
        };
        assert!(err.to_string().contains("404"));
    }
}
