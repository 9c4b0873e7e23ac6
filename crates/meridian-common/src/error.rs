//! Error types for Meridian.

use thiserror::Error;

/// Result type alias using MeridianError.
pub type Result<T> = std::result::Result<T, MeridianError>;

/// Errors that can occur in Meridian operations.
#[derive(Debug, Error)]
pub enum MeridianError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Geo query errors (user errors: surfaced as query rejections)
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("point not in interval of [ {min}, {max} )")]
    PointOutOfRange { min: f64, max: f64 },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid index configuration: {0}")]
    InvalidIndexConfig(String),

    // Journal recovery errors
    #[error("Journal corrupted in {file}: {reason}")]
    JournalCorrupted { file: String, reason: String },

    #[error("Journal checksum doesn't match. recorded: {recorded} actual: {actual}")]
    ChecksumMismatch { recorded: String, actual: String },

    #[error("Unexpected file in journal directory: {0}")]
    JournalDirectory(String),

    #[error("abrupt journal file end in {file}, yet it isn't the last journal file")]
    AbruptEnd { file: String },

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeridianError {
    /// Returns true for errors caused by a malformed query or document,
    /// which are reported to the caller rather than treated as data loss.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            MeridianError::InvalidQuery(_)
                | MeridianError::PointOutOfRange { .. }
                | MeridianError::InvalidGeometry(_)
                | MeridianError::InvalidIndexConfig(_)
        )
    }
}
