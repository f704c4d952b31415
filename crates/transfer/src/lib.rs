//! Chunk planning, byte sources and progress accounting for resumable uploads.

mod checksum;
mod planner;
mod progress;
mod source;
mod validation;

pub use checksum::{CHUNK_HASH_PREFIX, checksum_bytes, chunk_hash};
pub use planner::{ChunkDescriptor, ChunkLayout, ChunkLimits, ChunkPlanner};
pub use progress::{
    DEFAULT_PROGRESS_INTERVAL, MIN_PROGRESS_INTERVAL, ProgressCallback, ProgressEmitter,
    ProgressOverflow, ProgressState, ProgressUpdate, SpeedCalculator,
};
pub use source::{
    BoxFuture, BoxReader, FileSource, MemorySource, OpenReader, StreamSource, UploadSource,
};
pub use validation::{validate_file_name, validate_sub_path};

/// Errors produced while planning a chunk layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("empty files are not chunked")]
    EmptyFile,

    #[error("memory budget must be positive")]
    NoMemoryBudget,

    #[error("file of {file_size} bytes exceeds the chunkable maximum of {max_file_size} bytes")]
    FileTooLarge { file_size: u64, max_file_size: u64 },

    #[error("illegal chunk layout: {0}")]
    IllegalLayout(String),
}

/// Errors produced by name and path validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid file name: {0}")]
    InvalidName(String),
}
