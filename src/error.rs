//! Error types for reorder operations.

use thiserror::Error;

/// Errors that can occur while parsing or rewriting index artifacts.
///
/// Every variant is fatal to the current run. `Format` and
/// `UnsupportedVersion` mean the file must not be trusted at all;
/// `Invariant` means the caller's inputs are inconsistent and is always
/// raised before any output byte is written.
#[derive(Debug, Error)]
pub enum ReorderError {
    /// I/O error (file operations, disk I/O)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Format error (unexpected type tag, truncated stream, internal
    /// inconsistency between sections)
    #[error("format error in {file}: {detail}")]
    Format { file: String, detail: String },

    /// Checksum mismatch (data corruption detected)
    #[error("checksum mismatch in {file}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        file: String,
        expected: u32,
        actual: u32,
    },

    /// Version marker not recognized
    #[error("unsupported version {version} in {file}")]
    UnsupportedVersion { file: String, version: u32 },

    /// Invariant violated (non-bijective permutation, count mismatch,
    /// dimension mismatch)
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl ReorderError {
    /// Build a `Format` error tagged with the offending file.
    pub fn format(file: impl AsRef<std::path::Path>, detail: impl Into<String>) -> Self {
        Self::Format {
            file: file.as_ref().display().to_string(),
            detail: detail.into(),
        }
    }
}

/// Result type for reorder operations.
pub type Result<T> = std::result::Result<T, ReorderError>;
