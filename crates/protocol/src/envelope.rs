use serde::{Deserialize, Serialize};

/// Outcome marker carried by every API response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiResult {
    Success,
    Error,
}

/// Structured error body returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Envelope for all API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub result: ApiResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    /// Creates a success response carrying `data`.
    pub fn success(data: T) -> Self {
        Self {
            result: ApiResult::Success,
            data: Some(data),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn error(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            result: ApiResult::Error,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                description: description.into(),
            }),
        }
    }

    /// Returns `true` if the server reported success.
    pub fn is_success(&self) -> bool {
        self.result == ApiResult::Success
    }

    /// Splits the envelope into its data or its error.
    ///
    /// An error envelope without an error body yields an `ApiError` with an
    /// empty code so the caller can still classify it.
    pub fn into_result(self) -> Result<Option<T>, ApiError> {
        match self.result {
            ApiResult::Success => Ok(self.data),
            ApiResult::Error => Err(self.error.unwrap_or(ApiError {
                code: String::new(),
                description: "error response without details".into(),
            })),
        }
    }
}

/// Decodes the structured error of a non-success response body.
///
/// Returns `None` when the body is not an error envelope, so callers can
/// fall back to reporting the raw body.
pub fn decode_error_body(body: &[u8]) -> Option<ApiError> {
    let envelope: ApiResponse<serde_json::Value> = serde_json::from_slice(body).ok()?;
    envelope.error
}
