//! Upload error types.

use driveup_protocol::ApiError;
use driveup_transfer::PlanError;

/// Errors reported by a [`SessionClient`](crate::SessionClient).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error (HTTP {status}) {}: {}", error.code, error.description)]
    Api { status: u16, error: ApiError },

    #[error("upload session not found")]
    NotFound,

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("transfer aborted by progress observer")]
    Aborted,
}

/// Errors from a [`PendingUploadStore`](crate::PendingUploadStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures raised inside the engine before classification.
///
/// These never leave the crate raw; callers see an
/// [`UploadFailure`](crate::UploadFailure).
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("layout error: {0}")]
    Plan(#[from] PlanError),

    #[error("{0}")]
    Client(#[from] ClientError),

    #[error("pending store error: {0}")]
    Store(#[from] StoreError),

    #[error("source unavailable: {0}")]
    Source(std::io::Error),

    #[error("chunk upload rejected with HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("progress reached {attempted} of {total} bytes")]
    WrittenBytesExceeded { attempted: u64, total: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}
