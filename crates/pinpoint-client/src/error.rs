//! Messenger error type.

use pinpoint_core::{InboxError, RotationError, SessionError, StorageError};
use pinpoint_proto::{ErrorKind, PeerAddress, ProtocolError, RemoteError};
use thiserror::Error;

/// Errors surfaced by [`Messenger`](crate::Messenger) operations.
///
/// Every variant classifies into an [`ErrorKind`], which decides retry
/// behavior and the message shown to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessengerError {
    /// No device has been created for this address.
    #[error("no local device")]
    NoLocalDevice,

    /// A device is already set up locally for this address.
    #[error("a device already exists for {0}")]
    DeviceExists(PeerAddress),

    /// Location failed validation before sending.
    #[error("invalid location: {0}")]
    InvalidLocation(ProtocolError),

    /// Session establishment, encryption or decryption failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Directory request failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Key maintenance failed.
    #[error(transparent)]
    Rotation(#[from] RotationError),

    /// Inbox read or write failed.
    #[error(transparent)]
    Inbox(#[from] InboxError),
}

impl MessengerError {
    /// Classify into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoLocalDevice => ErrorKind::NoLocalDevice,
            Self::DeviceExists(_) => ErrorKind::DeviceAlreadyExists,
            Self::InvalidLocation(_) => ErrorKind::Format,
            Self::Session(e) => e.kind(),
            Self::Remote(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Rotation(e) => e.kind(),
            Self::Inbox(e) => e.kind(),
        }
    }

    /// True if repeating the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Actionable message for the user.
    pub fn user_message(&self) -> &'static str {
        self.kind().user_message()
    }
}
