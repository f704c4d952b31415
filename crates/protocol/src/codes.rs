//! Error codes reported in [`ApiError::code`](crate::ApiError).

/// Known API error codes relevant to uploads.
///
/// Unrecognized codes parse as [`ErrorCode::Unknown`] and keep the raw string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    LockError,
    DestinationNotFound,
    DestinationAlreadyExists,
    QuotaExceeded,
    LimitExceeded,
    ProductBlocked,
    ProductMaintenance,
    UploadTokenInvalid,
    UploadTokenCanceled,
    ObjectNotFound,
    UploadNotTerminated,
    NotAuthorized,
    Unknown(String),
}

impl ErrorCode {
    /// Parses a wire code string.
    pub fn parse(code: &str) -> Self {
        match code {
            "lock_error" => Self::LockError,
            "destination_not_found" | "destination_not_found_error" | "directory_not_found" => {
                Self::DestinationNotFound
            }
            "destination_already_exists" | "conflict_error" => Self::DestinationAlreadyExists,
            "quota_exceeded_error" | "quota_exceeded" => Self::QuotaExceeded,
            "limit_exceeded_error" | "limit_exceeded" => Self::LimitExceeded,
            "product_blocked" => Self::ProductBlocked,
            "product_maintenance" => Self::ProductMaintenance,
            "upload_token_is_not_valid" => Self::UploadTokenInvalid,
            "upload_token_canceled" => Self::UploadTokenCanceled,
            "object_not_found" => Self::ObjectNotFound,
            "upload_not_terminated" | "upload_not_terminated_error" => Self::UploadNotTerminated,
            "not_authorized" | "forbidden_error" => Self::NotAuthorized,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Returns the canonical wire string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::LockError => "lock_error",
            Self::DestinationNotFound => "destination_not_found",
            Self::DestinationAlreadyExists => "destination_already_exists",
            Self::QuotaExceeded => "quota_exceeded_error",
            Self::LimitExceeded => "limit_exceeded_error",
            Self::ProductBlocked => "product_blocked",
            Self::ProductMaintenance => "product_maintenance",
            Self::UploadTokenInvalid => "upload_token_is_not_valid",
            Self::UploadTokenCanceled => "upload_token_canceled",
            Self::ObjectNotFound => "object_not_found",
            Self::UploadNotTerminated => "upload_not_terminated_error",
            Self::NotAuthorized => "not_authorized",
            Self::Unknown(code) => code,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
