//! Chunked file transfer: resumable upload sessions, checksum verification,
//! and progress tracking for game deployments over the Agent/Hub transport.

mod chunked;
mod engine;
mod manifest;
mod progress;
mod types;
mod validation;

use std::time::Duration;

pub use chunked::{ChunkReader, ChunkWriter, calculate_file_checksum, checksum_bytes};
pub use engine::{StagedUpload, UploadEngine};
pub use manifest::manifest_hash;
pub use progress::{ProgressTracker, SpeedCalculator};
pub use types::{Chunk, UploadSession};
pub use validation::validate_upload_path;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// How long a cancelled or abandoned upload's staging directory is kept
/// before being deleted, so a reconnecting Hub can resume it.
pub const RESUME_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("chunk offset mismatch: expected {expected}, got {actual}")]
    OffsetMismatch { expected: i64, actual: i64 },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session not active: {0}")]
    SessionNotActive(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("upload incomplete: {relative_path} expected {expected} bytes, staged {actual}")]
    IncompleteUpload {
        relative_path: String,
        expected: i64,
        actual: i64,
    },
}

impl TransferError {
    /// Maps a transfer error onto the wire-level [`capydeploy_protocol::ErrorKind`]
    /// carried back to the Hub.
    pub fn error_kind(&self) -> capydeploy_protocol::ErrorKind {
        use capydeploy_protocol::ErrorKind;
        match self {
            TransferError::ChecksumMismatch => ErrorKind::ChecksumMismatch,
            TransferError::OffsetMismatch { .. } => ErrorKind::OffsetMismatch,
            TransferError::SessionNotFound(_) => ErrorKind::BadRequest,
            TransferError::SessionNotActive(_) => ErrorKind::BadRequest,
            TransferError::InvalidPath(_) => ErrorKind::BadRequest,
            TransferError::IncompleteUpload { .. } => ErrorKind::IncompleteUpload,
            TransferError::Io(_) => ErrorKind::Internal,
        }
    }
}
