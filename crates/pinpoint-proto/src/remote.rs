//! Closed error set returned by the remote directory and relay.

use thiserror::Error;

use crate::ErrorKind;

/// Failure reported by (or while talking to) the remote directory.
///
/// Transport adapters build this from `(status, body code)` pairs via
/// [`RemoteError::from_status`]; nothing downstream inspects free text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failed before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// No response within the configured deadline.
    #[error("request timed out")]
    Timeout,

    /// Credentials rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// Rate limited.
    #[error("throttled (retry after {retry_after_secs:?}s)")]
    Throttled {
        /// Server-suggested delay, if given.
        retry_after_secs: Option<u64>,
    },

    /// Opaque server failure.
    #[error("server error (status {status})")]
    Server {
        /// HTTP-style status code.
        status: u16,
    },

    /// Registration conflicts with an existing device for this identity.
    #[error("a device already exists for this identity")]
    DeviceAlreadyExists,

    /// Recipient account does not exist.
    #[error("recipient does not exist")]
    RecipientNotFound,

    /// Recipient account has no registered device.
    #[error("recipient has no registered device")]
    RecipientHasNoDevice,

    /// Recipient re-registered since our session was created.
    #[error("recipient device changed")]
    StaleRecipientDevice,

    /// Our own device record changed or was removed remotely.
    #[error("local device record changed remotely")]
    LocalDeviceChanged,

    /// Directory refused more prekeys.
    #[error("prekey pool exhausted")]
    PreKeyPoolExhausted,

    /// Uploaded prekey id already exists remotely.
    #[error("prekey id collision")]
    PreKeyIdCollision,

    /// Response could not be parsed, or the request was rejected as malformed.
    #[error("malformed exchange: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Map an HTTP-style status and optional body code to an error.
    ///
    /// Body codes refine statuses that are shared by several conditions.
    pub fn from_status(status: u16, code: Option<&str>, retry_after_secs: Option<u64>) -> Self {
        match (status, code) {
            (401 | 403, _) => Self::Unauthorized,
            (404, Some("no_device")) => Self::RecipientHasNoDevice,
            (404, _) => Self::RecipientNotFound,
            (409, Some("prekey_id_collision")) => Self::PreKeyIdCollision,
            (409, _) => Self::DeviceAlreadyExists,
            (410, Some("stale_recipient")) => Self::StaleRecipientDevice,
            (410, _) => Self::LocalDeviceChanged,
            (429, _) => Self::Throttled { retry_after_secs },
            (507, _) => Self::PreKeyPoolExhausted,
            (400, code) => Self::Malformed(code.unwrap_or("bad request").to_string()),
            (status, _) => Self::Server { status },
        }
    }

    /// Classify into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::Timeout => ErrorKind::Network,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Throttled { .. } => ErrorKind::Throttled,
            Self::Server { .. } | Self::PreKeyPoolExhausted => ErrorKind::ServerError,
            Self::DeviceAlreadyExists => ErrorKind::DeviceAlreadyExists,
            Self::RecipientNotFound => ErrorKind::RecipientNotFound,
            Self::RecipientHasNoDevice => ErrorKind::RecipientHasNoDevice,
            Self::StaleRecipientDevice => ErrorKind::AlteredIdentity,
            Self::LocalDeviceChanged => ErrorKind::RemoteDeviceChanged,
            Self::PreKeyIdCollision | Self::Malformed(_) => ErrorKind::Format,
        }
    }

    /// True if the same request may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        self.kind().is_retriable()
    }
}
