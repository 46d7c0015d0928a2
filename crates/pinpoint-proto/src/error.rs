//! Protocol-level errors.

use thiserror::Error;

/// Errors raised while building or parsing protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// CBOR decoding failed (truncated, wrong shape, trailing garbage).
    #[error("decode failed: {0}")]
    Decode(String),

    /// Combined identifier could not be parsed.
    #[error("invalid peer address: {0:?}")]
    InvalidAddress(String),

    /// Location coordinates are out of range.
    #[error("invalid location: {0}")]
    InvalidLocation(&'static str),

    /// Message body carries a version this build does not understand.
    #[error("unsupported body version: {0}")]
    UnsupportedVersion(u8),
}

impl ProtocolError {
    /// Every protocol error is a format problem.
    pub fn kind(&self) -> crate::ErrorKind {
        crate::ErrorKind::Format
    }
}
