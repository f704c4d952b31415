//! Data types crossing the engine boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use driveup_protocol::ConflictPolicy;
use driveup_protocol::types::RemoteFile;
use driveup_transfer::{ProgressUpdate, UploadSource};

use crate::classifier::{FailureKind, Verdict};

/// What queued the upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UploadOrigin {
    /// Started explicitly by the user.
    #[default]
    Manual,
    /// Queued by automatic folder sync.
    AutoSync,
}

/// A file to upload together with its destination.
pub struct UploadableFile {
    /// Stable identity correlating the pending record with a remote session.
    pub id: String,
    pub drive_id: i64,
    pub directory_id: i64,
    pub file_name: String,
    /// Relative folder to create under `directory_id`.
    pub sub_path: Option<String>,
    pub conflict: ConflictPolicy,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
    /// Size in bytes; corrected from the source before planning.
    pub size: u64,
    pub origin: UploadOrigin,
    source: Option<Arc<dyn UploadSource>>,
}

impl UploadableFile {
    pub fn new(
        id: impl Into<String>,
        drive_id: i64,
        directory_id: i64,
        file_name: impl Into<String>,
        size: u64,
        source: Arc<dyn UploadSource>,
    ) -> Self {
        Self {
            id: id.into(),
            drive_id,
            directory_id,
            file_name: file_name.into(),
            sub_path: None,
            conflict: ConflictPolicy::default(),
            created_at: None,
            modified_at: Utc::now(),
            size,
            origin: UploadOrigin::default(),
            source: Some(source),
        }
    }

    pub fn with_sub_path(mut self, sub_path: impl Into<String>) -> Self {
        self.sub_path = Some(sub_path.into());
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = conflict;
        self
    }

    pub fn with_timestamps(
        mut self,
        created_at: Option<DateTime<Utc>>,
        modified_at: DateTime<Utc>,
    ) -> Self {
        self.created_at = created_at;
        self.modified_at = modified_at;
        self
    }

    pub fn with_origin(mut self, origin: UploadOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Returns the byte source, or `None` once released.
    pub fn source(&self) -> Option<&Arc<dyn UploadSource>> {
        self.source.as_ref()
    }

    /// Releases the underlying byte source.
    pub fn release(&mut self) {
        self.source = None;
    }

    pub fn is_released(&self) -> bool {
        self.source.is_none()
    }
}

impl std::fmt::Debug for UploadableFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadableFile")
            .field("id", &self.id)
            .field("drive_id", &self.drive_id)
            .field("directory_id", &self.directory_id)
            .field("file_name", &self.file_name)
            .field("sub_path", &self.sub_path)
            .field("size", &self.size)
            .field("origin", &self.origin)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

/// Event emitted while an upload runs.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Rate-limited progress update.
    Progress {
        file_id: String,
        update: ProgressUpdate,
    },
    /// The file was committed remotely.
    Completed { file_id: String },
    /// The upload attempt failed.
    Failed { file_id: String, kind: FailureKind },
}

/// Summary of a successful upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadReport {
    /// File created remotely, when the server returns it.
    pub file: Option<RemoteFile>,
    /// Chunks transmitted during this call.
    pub chunks_sent: u32,
    /// Chunks skipped because the server already had them.
    pub chunks_skipped: u32,
    /// Whether an existing session was reused.
    pub resumed: bool,
    /// Sessions discarded and restarted during this call.
    pub session_restarts: u32,
}

/// A classified failure as seen by the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {description}")]
pub struct UploadFailure {
    pub kind: FailureKind,
    pub verdict: Verdict,
    pub description: String,
    /// Whether the scheduler may try again later.
    pub retryable: bool,
    /// Suggested minimum delay before retrying.
    pub retry_after: Option<Duration>,
    /// The local pending-upload record was discarded.
    pub record_discarded: bool,
    /// Automatic sync should be turned off for this destination.
    pub disable_auto_sync: bool,
}

/// Result of [`UploadEngine::upload`](crate::UploadEngine::upload).
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Completed(UploadReport),
    /// Stopped by the caller; the remote session is left resumable.
    Cancelled,
    Failed(UploadFailure),
}

impl UploadOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}
