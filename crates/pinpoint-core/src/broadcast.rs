//! Live broadcast registry: outbound live-location subscriptions.

use pinpoint_proto::{ErrorKind, PeerAddress};
use serde::{Deserialize, Serialize};

use crate::{
    storage::{KeyValueStore, StorageError},
    store::{LIVE_BROADCASTS, SecureStore},
};

/// An active live-location share with one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveBroadcast {
    /// Recipient device.
    pub recipient: PeerAddress,
    /// End of the share, unix milliseconds. Active while `now < expiry_ms`.
    pub expiry_ms: u64,
    /// Outcome of the most recent send, if it failed.
    pub last_error: Option<ErrorKind>,
}

impl LiveBroadcast {
    /// True while the share has not expired.
    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms < self.expiry_ms
    }
}

/// Transient view over the persisted broadcast list. At most one entry per
/// recipient.
pub struct BroadcastRegistry<'a, K: KeyValueStore> {
    store: &'a SecureStore<K>,
}

impl<'a, K: KeyValueStore> BroadcastRegistry<'a, K> {
    /// Borrow the store.
    pub fn new(store: &'a SecureStore<K>) -> Self {
        Self { store }
    }

    fn load(&self) -> Result<Vec<LiveBroadcast>, StorageError> {
        Ok(self.store.get_value(LIVE_BROADCASTS)?.unwrap_or_default())
    }

    fn save(&self, broadcasts: &[LiveBroadcast]) -> Result<(), StorageError> {
        if broadcasts.is_empty() {
            self.store.delete_value(LIVE_BROADCASTS)
        } else {
            self.store.set_value(LIVE_BROADCASTS, &broadcasts)
        }
    }

    /// Start (or restart) sharing with `recipient` until `expiry_ms`. Clears
    /// any recorded error.
    pub fn add(&self, recipient: &PeerAddress, expiry_ms: u64) -> Result<(), StorageError> {
        let mut broadcasts = self.load()?;
        broadcasts.retain(|b| b.recipient != *recipient);
        broadcasts.push(LiveBroadcast { recipient: recipient.clone(), expiry_ms, last_error: None });
        self.save(&broadcasts)
    }

    /// Unexpired broadcasts. Expired entries are purged from storage.
    pub fn list_active(&self, now_ms: u64) -> Result<Vec<LiveBroadcast>, StorageError> {
        let broadcasts = self.load()?;
        let before = broadcasts.len();
        let active: Vec<_> = broadcasts.into_iter().filter(|b| b.is_active(now_ms)).collect();

        if active.len() != before {
            tracing::debug!(expired = before - active.len(), "purged expired live broadcasts");
            self.save(&active)?;
        }
        Ok(active)
    }

    /// Broadcast to `recipient`, expired or not.
    pub fn get(&self, recipient: &PeerAddress) -> Result<Option<LiveBroadcast>, StorageError> {
        Ok(self.load()?.into_iter().find(|b| b.recipient == *recipient))
    }

    /// Stop sharing with `recipient`. Returns `false` if there was no share.
    pub fn remove(&self, recipient: &PeerAddress) -> Result<bool, StorageError> {
        let mut broadcasts = self.load()?;
        let before = broadcasts.len();
        broadcasts.retain(|b| b.recipient != *recipient);
        if broadcasts.len() == before {
            return Ok(false);
        }
        self.save(&broadcasts)?;
        Ok(true)
    }

    /// Record the outcome of the latest send to `recipient`. No-op if there
    /// is no broadcast for it.
    pub fn record_outcome(
        &self,
        recipient: &PeerAddress,
        error: Option<ErrorKind>,
    ) -> Result<bool, StorageError> {
        let mut broadcasts = self.load()?;
        let Some(entry) = broadcasts.iter_mut().find(|b| b.recipient == *recipient) else {
            return Ok(false);
        };
        if entry.last_error == error {
            return Ok(true);
        }
        entry.last_error = error;
        self.save(&broadcasts)?;
        Ok(true)
    }
}
