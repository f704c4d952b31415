//! Maps engine failures onto a closed set of kinds and verdicts.
//!
//! Classification is pure. The coordinator performs the side effect that
//! goes with each [`Verdict`].

use std::fmt;
use std::io;

use driveup_protocol::{ApiError, ErrorCode};
use driveup_transfer::PlanError;

use crate::error::{ClientError, UploadError};

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Send the same chunk again; the session stays valid.
    RetryChunk,
    /// Clear the stored token, cancel the remote session, plan again.
    RetrySession,
    /// Stop; cancel the remote session if one exists.
    Fatal,
    /// Stop, cancel the session and discard the local pending record.
    FatalWithCleanup,
}

impl Verdict {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RetryChunk | Self::RetrySession)
    }
}

/// Closed taxonomy of upload failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    NetworkUnavailable,
    SourceReadFailed,
    LockError,
    FolderNotFound,
    QuotaExceeded,
    ProductBlocked,
    ProductMaintenance,
    UploadTokenInvalid,
    ObjectNotFound,
    ServerError,
    WrittenBytesExceeded,
    SessionIncomplete,
    FileTooLarge,
    LimitExceeded,
    DestinationExists,
    NotAuthorized,
    SourceUnavailable,
    InvalidRequest,
    Unexpected,
}

impl FailureKind {
    /// Returns the verdict prescribed for this kind.
    pub fn verdict(self) -> Verdict {
        match self {
            Self::NetworkUnavailable | Self::SourceReadFailed => Verdict::RetryChunk,
            Self::LockError
            | Self::UploadTokenInvalid
            | Self::ObjectNotFound
            | Self::ServerError
            | Self::WrittenBytesExceeded
            | Self::SessionIncomplete
            | Self::Unexpected => Verdict::RetrySession,
            Self::QuotaExceeded
            | Self::ProductBlocked
            | Self::ProductMaintenance
            | Self::LimitExceeded
            | Self::DestinationExists
            | Self::NotAuthorized
            | Self::InvalidRequest => Verdict::Fatal,
            Self::FolderNotFound | Self::FileTooLarge | Self::SourceUnavailable => {
                Verdict::FatalWithCleanup
            }
        }
    }

    /// Whether the failure should be shown to the user as is.
    pub fn is_user_visible(self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded
                | Self::ProductBlocked
                | Self::ProductMaintenance
                | Self::LimitExceeded
                | Self::DestinationExists
                | Self::FolderNotFound
                | Self::FileTooLarge
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkUnavailable => "network_unavailable",
            Self::LockError => "lock_error",
            Self::FolderNotFound => "folder_not_found",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ProductBlocked => "product_blocked",
            Self::ProductMaintenance => "product_maintenance",
            Self::UploadTokenInvalid => "upload_token_invalid",
            Self::ObjectNotFound => "object_not_found",
            Self::ServerError => "server_error",
            Self::WrittenBytesExceeded => "written_bytes_exceeded",
            Self::SessionIncomplete => "session_incomplete",
            Self::FileTooLarge => "file_too_large",
            Self::LimitExceeded => "limit_exceeded",
            Self::DestinationExists => "destination_exists",
            Self::NotAuthorized => "not_authorized",
            Self::SourceUnavailable => "source_unavailable",
            Self::SourceReadFailed => "source_read_failed",
            Self::InvalidRequest => "invalid_request",
            Self::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    pub verdict: Verdict,
    pub description: String,
}

/// Classifies an engine failure.
pub fn classify(error: &UploadError) -> Classification {
    let kind = match error {
        UploadError::Plan(PlanError::FileTooLarge { .. }) => FailureKind::FileTooLarge,
        UploadError::Plan(_) | UploadError::InvalidRequest(_) => FailureKind::InvalidRequest,
        UploadError::Client(e) => client_kind(e),
        UploadError::HttpStatus { status, .. } => status_kind(*status),
        UploadError::Source(e) => source_kind(e),
        UploadError::WrittenBytesExceeded { .. } => FailureKind::WrittenBytesExceeded,
        UploadError::Store(_) | UploadError::Internal(_) => FailureKind::Unexpected,
    };

    Classification {
        kind,
        verdict: kind.verdict(),
        description: describe(error),
    }
}

/// Only a file that is gone, unreadable or shorter than announced is final.
fn source_kind(error: &io::Error) -> FailureKind {
    match error.kind() {
        io::ErrorKind::NotFound
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::UnexpectedEof => FailureKind::SourceUnavailable,
        _ => FailureKind::SourceReadFailed,
    }
}

fn client_kind(error: &ClientError) -> FailureKind {
    match error {
        ClientError::Transport(_) => FailureKind::NetworkUnavailable,
        ClientError::NotFound => FailureKind::ObjectNotFound,
        ClientError::Api { status, error } => api_kind(*status, error),
        ClientError::Decode(_) | ClientError::Aborted => FailureKind::Unexpected,
    }
}

fn api_kind(status: u16, error: &ApiError) -> FailureKind {
    match ErrorCode::parse(&error.code) {
        ErrorCode::LockError => FailureKind::LockError,
        ErrorCode::DestinationNotFound => FailureKind::FolderNotFound,
        ErrorCode::DestinationAlreadyExists => FailureKind::DestinationExists,
        ErrorCode::QuotaExceeded => FailureKind::QuotaExceeded,
        ErrorCode::LimitExceeded => FailureKind::LimitExceeded,
        ErrorCode::ProductBlocked => FailureKind::ProductBlocked,
        ErrorCode::ProductMaintenance => FailureKind::ProductMaintenance,
        ErrorCode::UploadTokenInvalid | ErrorCode::UploadTokenCanceled => {
            FailureKind::UploadTokenInvalid
        }
        ErrorCode::ObjectNotFound => FailureKind::ObjectNotFound,
        ErrorCode::UploadNotTerminated => FailureKind::SessionIncomplete,
        ErrorCode::NotAuthorized => FailureKind::NotAuthorized,
        ErrorCode::Unknown(_) => status_kind(status),
    }
}

/// Fallback for responses without a recognized error code.
fn status_kind(status: u16) -> FailureKind {
    match status {
        401 | 403 => FailureKind::NotAuthorized,
        404 => FailureKind::ObjectNotFound,
        423 => FailureKind::LockError,
        500..=599 => FailureKind::ServerError,
        _ => FailureKind::Unexpected,
    }
}

fn describe(error: &UploadError) -> String {
    match error {
        UploadError::Client(ClientError::Api { error, .. }) if !error.description.is_empty() => {
            error.description.clone()
        }
        other => other.to_string(),
    }
}
