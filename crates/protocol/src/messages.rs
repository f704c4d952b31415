use serde::{Deserialize, Serialize};

use crate::types::{ChunkStatus, ConflictPolicy, RemoteFile};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Opens a new upload session.
///
/// Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub conflict: ConflictPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    pub directory_id: i64,
    pub file_name: String,
    pub last_modified_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_directory_path: Option<String>,
    pub total_chunks: u32,
    pub total_size: u64,
}

/// Query parameters of a chunk upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadChunkQuery {
    pub chunk_number: u32,
    pub chunk_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chunk_hash: String,
}

/// Query parameters of a direct (sessionless) empty-file upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmptyFileQuery {
    pub directory_id: i64,
    pub file_name: String,
    pub total_size: u64,
    pub conflict: ConflictPolicy,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Session handle returned by `upload/session/start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub token: String,
    /// Host that receives chunk uploads for this session.
    pub upload_url: String,
}

/// One chunk as recorded by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionChunk {
    pub number: u32,
    pub status: ChunkStatus,
    #[serde(default)]
    pub size: u64,
}

/// Server-side state of an existing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub expected_chunks: u32,
    pub expected_size: u64,
    #[serde(default)]
    pub uploaded_chunks: u32,
    #[serde(default)]
    pub uploaded_size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<SessionChunk>,
}

impl SessionStatusResponse {
    /// Returns the numbers of chunks the server validated, in ascending order.
    pub fn accepted_chunk_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Ok)
            .map(|c| c.number)
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    }

    /// Infers the session's chunk size from its accepted chunks.
    ///
    /// Every chunk but the last has the full chunk size, so the largest
    /// accepted chunk is the chunk size unless only the last one was accepted.
    /// Returns `None` when no chunk can vouch for it.
    pub fn inferred_chunk_size(&self) -> Option<u64> {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Ok && c.number < self.expected_chunks)
            .map(|c| c.size)
            .max()
            .filter(|size| *size > 0)
    }
}

/// Result of `upload/session/{token}/finish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishSessionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<RemoteFile>,
}
