//! Error types for the save log.

use thiserror::Error;

/// Main error type for save operations.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Save log corrupted: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid save format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Record at offset {offset} needs {needed} bytes but only {capacity} are reserved")]
    RecordOverflow {
        offset: u64,
        needed: usize,
        capacity: usize,
    },

    #[error("User value {key:?} is a {found}, not a {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not supported: {0}")]
    Unsupported(&'static str),

    #[error("Save root not initialized")]
    NotInitialized,
}

impl SaveError {
    /// Whether this error means the log itself can no longer be trusted.
    ///
    /// Callers loading a save family treat these as "reset progress" rather
    /// than a crash.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SaveError::Corruption(_)
                | SaveError::ChecksumMismatch { .. }
                | SaveError::InvalidFormat(_)
                | SaveError::Deserialization(_)
        )
    }
}

impl From<serde_json::Error> for SaveError {
    fn from(e: serde_json::Error) -> Self {
        SaveError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SaveError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SaveError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SaveError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SaveError::Deserialization(e.to_string())
    }
}

/// Result type for save operations.
pub type Result<T> = std::result::Result<T, SaveError>;
