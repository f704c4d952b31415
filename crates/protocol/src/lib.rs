//! Wire types for the remote drive upload-session API.
//!
//! Every endpoint answers with the same JSON [`envelope`]; request and
//! response bodies live in [`messages`], shared value types in [`types`].

pub mod codes;
pub mod envelope;
pub mod messages;
pub mod types;

pub use codes::ErrorCode;
pub use envelope::{ApiError, ApiResponse, ApiResult};
pub use types::ConflictPolicy;
