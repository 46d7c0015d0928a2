//! Delete-reconciliation ledger.
//!
//! Remembers relay message ids whose deletion failed deterministically so the
//! client never re-requests them. Successful deletions are never recorded.
//! The set is pruned to ids the relay still returns, which bounds it by the
//! relay's own backlog.

use std::collections::BTreeSet;

use crate::{
    storage::{KeyValueStore, StorageError},
    store::{FAILED_DELETES, SecureStore},
};

/// Transient view over the failed-delete set.
pub struct DeleteLedger<'a, K: KeyValueStore> {
    store: &'a SecureStore<K>,
}

impl<'a, K: KeyValueStore> DeleteLedger<'a, K> {
    /// Borrow the store.
    pub fn new(store: &'a SecureStore<K>) -> Self {
        Self { store }
    }

    fn load(&self) -> Result<BTreeSet<u64>, StorageError> {
        Ok(self.store.get_value(FAILED_DELETES)?.unwrap_or_default())
    }

    fn save(&self, ids: &BTreeSet<u64>) -> Result<(), StorageError> {
        if ids.is_empty() {
            self.store.delete_value(FAILED_DELETES)
        } else {
            self.store.set_value(FAILED_DELETES, ids)
        }
    }

    /// `ids` minus every recorded failure, order preserved.
    pub fn filter_new(&self, ids: &[u64]) -> Result<Vec<u64>, StorageError> {
        let failed = self.load()?;
        Ok(ids.iter().copied().filter(|id| !failed.contains(id)).collect())
    }

    /// Record a failed deletion.
    pub fn record_failure(&self, id: u64) -> Result<(), StorageError> {
        self.record_failures(&[id])
    }

    /// Record several failed deletions in one write.
    pub fn record_failures(&self, ids: &[u64]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut failed = self.load()?;
        failed.extend(ids.iter().copied());
        self.save(&failed)
    }

    /// Forget failures for ids the relay no longer returns.
    ///
    /// Returns the number of ids dropped.
    pub fn retain_only(&self, still_pending: &[u64]) -> Result<usize, StorageError> {
        let mut failed = self.load()?;
        let before = failed.len();
        let pending: BTreeSet<u64> = still_pending.iter().copied().collect();
        failed.retain(|id| pending.contains(id));

        let dropped = before - failed.len();
        if dropped > 0 {
            self.save(&failed)?;
        }
        Ok(dropped)
    }

    /// Number of recorded failures.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.load()?.len())
    }

    /// True if no failures are recorded.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}
