use serde::{Deserialize, Serialize};

/// What the server does when the destination name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Fail with `destination_already_exists`.
    Error,
    /// Store the upload as a new version of the existing file.
    #[default]
    Version,
    /// Keep both, renaming the uploaded file.
    Rename,
}

impl ConflictPolicy {
    /// Returns the wire string (used in query parameters).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Version => "version",
            Self::Rename => "rename",
        }
    }
}

/// Server-side state of a single uploaded chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Ok,
    Error,
    #[serde(other)]
    Pending,
}

/// File created by a finished session or an empty-file upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
}
