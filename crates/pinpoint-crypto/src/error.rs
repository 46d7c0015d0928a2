//! Session engine errors.

use pinpoint_proto::{ErrorKind, IdentityKey, PeerAddress};
use thiserror::Error;

/// Errors from session establishment, encryption and decryption.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Peer presented an identity that differs from the trusted record.
    #[error("identity of {peer} changed (observed {observed:?})")]
    UntrustedIdentity {
        /// Peer whose identity changed.
        peer: PeerAddress,
        /// Identity observed in the bundle, message or session.
        observed: IdentityKey,
    },

    /// No session exists for the peer.
    #[error("no session for {0}")]
    NoSession(PeerAddress),

    /// Signed prekey signature did not verify against the identity key.
    #[error("signed prekey signature is invalid")]
    InvalidSignature,

    /// Message could not be parsed or is structurally unacceptable.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// AEAD authentication failed.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Message key for this header was already used.
    #[error("duplicate message")]
    DuplicateMessage,

    /// Referenced one-time prekey is not held locally.
    #[error("one-time prekey {0} not found")]
    MissingPreKey(u32),

    /// Referenced signed prekey is not held locally.
    #[error("signed prekey {0} not found")]
    MissingSignedPreKey(u32),

    /// Backing store failed.
    #[error("store error: {0}")]
    Storage(String),

    /// Backing store held unreadable data. The record has been discarded.
    #[error("corrupt stored state: {0}")]
    CorruptState(String),
}

impl CryptoError {
    /// Classify into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UntrustedIdentity { .. } => ErrorKind::AlteredIdentity,
            Self::Storage(_) => ErrorKind::Storage,
            Self::NoSession(_)
            | Self::InvalidSignature
            | Self::InvalidMessage(_)
            | Self::DecryptionFailed
            | Self::DuplicateMessage
            | Self::MissingPreKey(_)
            | Self::MissingSignedPreKey(_)
            | Self::CorruptState(_) => ErrorKind::Format,
        }
    }
}
