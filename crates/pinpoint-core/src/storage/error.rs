//! Storage error types.
//!
//! - `Io`: Underlying storage system errors
//! - `Corrupt`: A stored value could not be decoded and has been removed

use pinpoint_proto::ErrorKind;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),

    /// Stored value failed to decode. The entry has already been deleted.
    #[error("corrupt entry {key}: {reason}")]
    Corrupt {
        /// Store key (without namespace) that held the value
        key: String,
        /// Decoder message
        reason: String,
    },

    /// Value failed to encode
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Classify into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Storage,
            Self::Corrupt { .. } | Self::Serialization(_) => ErrorKind::Format,
        }
    }
}
