//! Remote session operations consumed by the engine.
//!
//! `SessionClient` is implemented by the transport crate; tests use an
//! in-memory double.

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use driveup_protocol::ConflictPolicy;
use driveup_protocol::messages::{
    EmptyFileQuery, SessionStatusResponse, StartSessionRequest, UploadChunkQuery,
};
use driveup_protocol::types::RemoteFile;
use driveup_transfer::BoxFuture;

use crate::error::ClientError;

/// Parameters of a new upload session.
#[derive(Debug, Clone, PartialEq)]
pub struct StartSession {
    pub drive_id: i64,
    pub directory_id: i64,
    pub file_name: String,
    pub sub_path: Option<String>,
    pub total_chunks: u32,
    pub total_size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
    pub conflict: ConflictPolicy,
}

impl StartSession {
    /// Builds the request body of `upload/session/start`.
    pub fn to_request(&self) -> StartSessionRequest {
        StartSessionRequest {
            conflict: self.conflict,
            created_at: self.created_at.map(|t| t.timestamp()),
            directory_id: self.directory_id,
            file_name: self.file_name.clone(),
            last_modified_at: self.modified_at.timestamp(),
            sub_directory_path: self.sub_path.clone(),
            total_chunks: self.total_chunks,
            total_size: self.total_size,
        }
    }
}

/// Handle of a remote upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub token: String,
    /// Host receiving this session's chunks.
    pub upload_host: String,
}

/// Server-side view of an existing session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptedChunks {
    pub expected_size: u64,
    pub expected_chunks: u32,
    /// Chunk size of the session, when the server can tell.
    pub chunk_size: Option<u64>,
    pub accepted: BTreeSet<u32>,
}

impl From<SessionStatusResponse> for AcceptedChunks {
    fn from(status: SessionStatusResponse) -> Self {
        Self {
            expected_size: status.expected_size,
            expected_chunks: status.expected_chunks,
            chunk_size: status.inferred_chunk_size(),
            accepted: status.accepted_chunk_numbers().into_iter().collect(),
        }
    }
}

/// Destination of one chunk upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTarget {
    pub upload_host: String,
    pub drive_id: i64,
    pub token: String,
    /// 1-based chunk number.
    pub chunk_number: u32,
    pub chunk_size: u64,
    /// `sha256:<hex>` of the chunk bytes.
    pub chunk_hash: String,
}

impl ChunkTarget {
    pub fn query(&self) -> UploadChunkQuery {
        UploadChunkQuery {
            chunk_number: self.chunk_number,
            chunk_size: self.chunk_size,
            chunk_hash: self.chunk_hash.clone(),
        }
    }
}

/// Status and body of a chunk upload, validated by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Parameters of a zero-byte file creation.
#[derive(Debug, Clone, PartialEq)]
pub struct EmptyFile {
    pub drive_id: i64,
    pub directory_id: i64,
    pub file_name: String,
    pub conflict: ConflictPolicy,
}

impl EmptyFile {
    pub fn query(&self) -> EmptyFileQuery {
        EmptyFileQuery {
            directory_id: self.directory_id,
            file_name: self.file_name.clone(),
            total_size: 0,
            conflict: self.conflict,
        }
    }
}

/// Receives transport progress of one chunk upload.
pub trait TransferObserver: Send + Sync {
    /// Called with the cumulative number of body bytes sent so far.
    ///
    /// Returning `Break` aborts the transfer.
    fn bytes_sent(&self, total: u64) -> ControlFlow<()>;
}

/// Remote operations of the upload-session protocol.
pub trait SessionClient: Send + Sync {
    /// Opens a new session.
    fn start_session(
        &self,
        request: StartSession,
    ) -> BoxFuture<'_, Result<UploadSession, ClientError>>;

    /// Returns the chunks already accepted for `token`.
    ///
    /// Fails with [`ClientError::NotFound`] if the session is gone.
    fn query_accepted_chunks(
        &self,
        drive_id: i64,
        token: String,
    ) -> BoxFuture<'_, Result<AcceptedChunks, ClientError>>;

    /// Sends one chunk.
    ///
    /// Non-2xx answers are returned as a [`RawResponse`], not as an error.
    fn upload_chunk(
        &self,
        target: ChunkTarget,
        data: Vec<u8>,
        observer: Arc<dyn TransferObserver>,
    ) -> BoxFuture<'_, Result<RawResponse, ClientError>>;

    /// Commits the session into a file.
    fn finish_session(
        &self,
        drive_id: i64,
        token: String,
    ) -> BoxFuture<'_, Result<Option<RemoteFile>, ClientError>>;

    /// Cancels the session.
    fn cancel_session(&self, drive_id: i64, token: String)
    -> BoxFuture<'_, Result<(), ClientError>>;

    /// Creates a zero-byte file without a session.
    fn create_empty_file(
        &self,
        request: EmptyFile,
    ) -> BoxFuture<'_, Result<Option<RemoteFile>, ClientError>>;
}
