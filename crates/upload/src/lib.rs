//! Resumable chunked uploads to a remote drive.
//!
//! This crate holds the upload **business logic**: chunk planning is
//! delegated to `driveup-transfer`, and the HTTP surface is abstracted
//! behind [`SessionClient`] so the application can plug in
//! `driveup-http` or a test double.
//!
//! # Lifecycle
//!
//! 1. **Plan**: re-check the size and compute the chunk layout
//! 2. **Resume or start**: reuse a stored session or open a new one
//! 3. **Transfer**: send missing chunks through a bounded pool
//! 4. **Finish**: commit the session and clear the stored token
//!
//! Failures are classified into a [`FailureKind`] whose [`Verdict`]
//! decides between retrying a chunk, restarting the session or giving up.

pub mod classifier;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod store;
pub mod types;

mod transmitter;

#[cfg(test)]
mod mock;

pub use classifier::{Classification, FailureKind, Verdict, classify};
pub use client::{
    AcceptedChunks, ChunkTarget, EmptyFile, RawResponse, SessionClient, StartSession,
    TransferObserver, UploadSession,
};
pub use config::{ConfigError, EngineConfig};
pub use coordinator::UploadEngine;
pub use error::{ClientError, StoreError, UploadError};
pub use store::{JsonFilePendingStore, MemoryPendingStore, PendingUploadStore, StoredSession};
pub use types::{
    UploadEvent, UploadFailure, UploadOrigin, UploadOutcome, UploadReport, UploadableFile,
};
