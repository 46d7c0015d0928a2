//! Message inbox: the latest message from each sender.

use std::cmp::Ordering;

use pinpoint_proto::{ErrorKind, Location, PeerAddress};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    storage::{KeyValueStore, StorageError},
    store::{MESSAGE_PREFIX, SecureStore},
};

/// Inbox errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InboxError {
    /// Stored messages were unreadable and have been deleted.
    #[error("corrupt stored messages removed: {senders:?}")]
    CorruptData {
        /// Senders whose entries were discarded. Entries whose key no longer
        /// names a sender are removed without being listed.
        senders: Vec<PeerAddress>,
    },

    /// Local storage failure.
    #[error(transparent)]
    Storage(StorageError),
}

impl InboxError {
    /// Classify into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CorruptData { .. } => ErrorKind::Format,
            Self::Storage(e) => e.kind(),
        }
    }
}

/// What a stored message carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessagePayload {
    /// A decrypted location.
    Location(Location),
    /// The message could not be processed.
    Error(ErrorKind),
}

/// Latest message from one sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Relay message id.
    pub id: u64,
    /// Sending device.
    pub sender: PeerAddress,
    /// Local receive time, unix milliseconds.
    pub received_at_ms: u64,
    /// Content.
    pub payload: MessagePayload,
}

impl StoredMessage {
    /// Location, if this message carries one.
    pub fn location(&self) -> Option<&Location> {
        match &self.payload {
            MessagePayload::Location(location) => Some(location),
            MessagePayload::Error(_) => None,
        }
    }
}

/// One row of the inbox overview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Sending device.
    pub sender: PeerAddress,
    /// Local receive time, unix milliseconds.
    pub received_at_ms: u64,
    /// The stored message is an error marker.
    pub is_error: bool,
    /// The stored location belongs to a live broadcast.
    pub is_live: bool,
}

/// Result of [`MessageInbox::summarize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboxSummary {
    /// Rows, newest first.
    pub entries: Vec<Summary>,
}

/// Transient view over the per-sender message entries.
pub struct MessageInbox<'a, K: KeyValueStore> {
    store: &'a SecureStore<K>,
}

impl<'a, K: KeyValueStore> MessageInbox<'a, K> {
    /// Borrow the store.
    pub fn new(store: &'a SecureStore<K>) -> Self {
        Self { store }
    }

    fn key(sender: &PeerAddress) -> String {
        format!("{MESSAGE_PREFIX}{}", sender.combined_id())
    }

    /// Store `message`, replacing any earlier message from the same sender.
    pub fn store(&self, message: &StoredMessage) -> Result<(), InboxError> {
        self.store.set_value(&Self::key(&message.sender), message).map_err(InboxError::Storage)
    }

    /// Store `message` unless the entry for its sender came from the same or
    /// a later relay message. Returns `false` if the stored entry was kept.
    ///
    /// Relay ids grow monotonically, so an id not above the stored one is a
    /// redelivery. A
    /// corrupt entry is replaced.
    pub fn store_if_newer(&self, message: &StoredMessage) -> Result<bool, InboxError> {
        match self.load(&message.sender) {
            Ok(Some(stored)) if stored.id >= message.id => return Ok(false),
            Ok(_) | Err(InboxError::CorruptData { .. }) => {},
            Err(e) => return Err(e),
        }
        self.store(message)?;
        Ok(true)
    }

    /// Latest message from `sender`.
    pub fn load(&self, sender: &PeerAddress) -> Result<Option<StoredMessage>, InboxError> {
        match self.store.get_value(&Self::key(sender)) {
            Ok(message) => Ok(message),
            Err(StorageError::Corrupt { .. }) => {
                Err(InboxError::CorruptData { senders: vec![sender.clone()] })
            },
            Err(e) => Err(InboxError::Storage(e)),
        }
    }

    /// Remove the message from `sender`.
    pub fn remove(&self, sender: &PeerAddress) -> Result<(), InboxError> {
        self.store.delete_value(&Self::key(sender)).map_err(InboxError::Storage)
    }

    /// Every stored message, newest first. Ties are ordered by sender.
    ///
    /// If any entry is corrupt, every corrupt entry is removed and
    /// [`InboxError::CorruptData`] is returned instead of a partial list. A
    /// retry then sees only the readable entries.
    pub fn summarize(&self) -> Result<InboxSummary, InboxError> {
        let mut summary = InboxSummary::default();
        let mut corrupt = false;
        let mut discarded = Vec::new();

        for key in self.store.keys_with_prefix(MESSAGE_PREFIX).map_err(InboxError::Storage)? {
            match self.store.get_value::<StoredMessage>(&key) {
                Ok(Some(message)) => summary.entries.push(Summary {
                    is_error: matches!(message.payload, MessagePayload::Error(_)),
                    is_live: message.location().is_some_and(Location::is_live),
                    received_at_ms: message.received_at_ms,
                    sender: message.sender,
                }),
                Ok(None) => {},
                Err(StorageError::Corrupt { .. }) => {
                    corrupt = true;
                    let sender = key
                        .strip_prefix(MESSAGE_PREFIX)
                        .and_then(|combined| PeerAddress::parse_combined(combined).ok());
                    discarded.extend(sender);
                },
                Err(e) => return Err(InboxError::Storage(e)),
            }
        }

        if corrupt {
            return Err(InboxError::CorruptData { senders: discarded });
        }
        summary.entries.sort_by(newest_first);
        Ok(summary)
    }

    /// Remove every stored message.
    pub fn clear(&self) -> Result<usize, InboxError> {
        let keys = self.store.keys_with_prefix(MESSAGE_PREFIX).map_err(InboxError::Storage)?;
        for key in &keys {
            self.store.delete_value(key).map_err(InboxError::Storage)?;
        }
        Ok(keys.len())
    }
}

fn newest_first(a: &Summary, b: &Summary) -> Ordering {
    b.received_at_ms.cmp(&a.received_at_ms).then_with(|| a.sender.cmp(&b.sender))
}
