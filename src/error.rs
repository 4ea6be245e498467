//! Error types for the cache boundaries.
//!
//! Faults inside a loading pipeline never cross the entry boundary as errors:
//! they are captured into the entry's [`LoadError`] and surface only through
//! the entry's observable state.

use thiserror::Error;

/// Error code recorded when decoding fails or a format is unsupported.
pub const CODE_DECODE: i32 = -2;
/// Error code recorded for an unexpected fault anywhere in the pipeline.
pub const CODE_UNEXPECTED: i32 = -3;

/// Terminal load failure captured into a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    /// HTTP status for transport failures, `-2` for decode/unsupported,
    /// `-3` for unexpected faults.
    pub code: i32,
    pub message: String,
}

impl LoadError {
    pub fn transport(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            code: CODE_DECODE,
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self {
            code: CODE_UNEXPECTED,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "load failed (code {}): {}", self.code, self.message)
    }
}

/// Errors from the persisted blob/metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid cache path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("metadata file is corrupt: {0}")]
    CorruptMetadata(String),
}

/// Errors from the HTTP transport seam.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport failure: {0}")]
    Other(String),
}

/// Errors from the decoder / atlas collaborator seams.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("image could not be decoded: {0}")]
    Malformed(String),
    #[error("animated sequence decoded to zero frames")]
    EmptyAnimation,
    #[error("format `{0}` is not supported by this decoder")]
    Unsupported(&'static str),
}
