//! Error taxonomy for the photo collection engine.
//!
//! Every failure that can end a fetch cycle is one of these variants. They are
//! cheap to clone so the same value can be logged, returned to the caller and
//! carried inside a `collection-failed` event.

use thiserror::Error;

/// Failures raised by the search, materialize and persist pipeline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The reachability check reported no route to the service
    #[error("network unavailable")]
    NetworkUnavailable,

    /// Non-2xx status, timeout, or any other transport failure
    #[error("transport error: {0}")]
    TransportError(String),

    /// The response body could not be decoded into the expected envelope
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The service answered with a well-formed error envelope
    #[error("service error {code}: {message}")]
    ServiceError { code: i64, message: String },

    /// The query matched nothing. Not a failure; callers must tell it apart.
    #[error("search returned no photos")]
    EmptyResult,

    /// A required save did not complete
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// The pin or photo is no longer resolvable in the store
    #[error("not found: {0}")]
    NotFound(String),
}

impl SyncError {
    /// Whether retrying on the next `ensure`/`refresh` can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable
                | SyncError::TransportError(_)
                | SyncError::MalformedResponse(_)
                | SyncError::ServiceError { .. }
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::TransportError(err.to_string())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
