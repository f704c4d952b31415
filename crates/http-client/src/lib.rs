//! HTTP transport for the upload engine.
//!
//! Implements [`driveup_upload::SessionClient`] against the drive's REST API
//! with `reqwest`. Chunk bodies are streamed in 64 KiB slices so the engine
//! sees transport-level progress.

mod body;
pub mod client;
pub mod config;

pub use body::SLICE_SIZE;
pub use client::{HttpError, HttpSessionClient};
pub use config::{DEFAULT_REQUEST_TIMEOUT, HttpClientConfig};
