use crate::types::{BufId, Ino};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SoftdepError {
    #[error("Write already in progress on buffer {0}")]
    WriteInProgress(BufId),

    #[error("No write in progress on buffer {0}")]
    NoWriteInProgress(BufId),

    #[error("Dependency inconsistency in {context}: {detail}")]
    Inconsistency {
        context: &'static str,
        detail: String,
    },

    #[error("Freed block count mismatch for inode {ino}: expected {expected}, released {released}")]
    AccountingMismatch {
        ino: Ino,
        expected: u64,
        released: u64,
    },

    #[error("Dependencies still pending after {0} drain passes")]
    DrainStalled(usize),

    #[error("Filesystem needs a consistency check")]
    NeedsFsck,

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error on buffer {buf}: {message}")]
    Io { buf: BufId, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl SoftdepError {
    pub fn inconsistency(context: &'static str, detail: impl Into<String>) -> Self {
        SoftdepError::Inconsistency {
            context,
            detail: detail.into(),
        }
    }

    /// Errors after which the dependency graph can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SoftdepError::Inconsistency { .. }
                | SoftdepError::AccountingMismatch { .. }
                | SoftdepError::DrainStalled(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SoftdepError::inconsistency("test", "bad").is_fatal());
        assert!(SoftdepError::AccountingMismatch { ino: 3, expected: 8, released: 4 }.is_fatal());
        assert!(SoftdepError::DrainStalled(10).is_fatal());
        assert!(!SoftdepError::WriteInProgress(BufId(7)).is_fatal());
        assert!(!SoftdepError::NeedsFsck.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = SoftdepError::AccountingMismatch { ino: 5, expected: 12, released: 8 };
        assert_eq!(
            err.to_string(),
            "Freed block count mismatch for inode 5: expected 12, released 8"
        );
        assert_eq!(
            SoftdepError::WriteInProgress(BufId(42)).to_string(),
            "Write already in progress on buffer buf#42"
        );
    }
}
