use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use super::{KeyValueStore, StorageError};

/// In-memory store for testing and simulation
///
/// Ordered map behind Arc<Mutex<>> so clones share state and prefix listing
/// is a range scan. Uses `lock().expect()` which will panic if the mutex is
/// poisoned - acceptable for test code.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a raw value, bypassing any encoding. Used to plant corrupt
    /// data in tests.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn insert_raw(&self, key: impl Into<String>, value: Vec<u8>) {
        self.inner.lock().expect("Mutex poisoned").insert(key.into(), value);
    }
}

impl KeyValueStore for MemoryStore {
    #[allow(clippy::expect_used)]
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").get(key).cloned())
    }

    #[allow(clippy::expect_used)]
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").insert(key.to_string(), value.to_vec());
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").remove(key);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let store = MemoryStore::new();
        let clone = store.clone();

        store.set("a", b"1").unwrap();
        assert_eq!(clone.get("a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn prefix_listing_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        for key in ["alice.1/msg:b", "alice.1/msg:a", "alice.1/session:x", "alice.10/msg:a"] {
            store.set(key, b"v").unwrap();
        }

        let keys = store.list_keys_with_prefix("alice.1/msg:").unwrap();
        assert_eq!(keys, vec!["alice.1/msg:a".to_string(), "alice.1/msg:b".to_string()]);
    }

    #[test]
    fn delete_missing_key_is_ok() {
        let store = MemoryStore::new();
        assert!(store.delete("nothing").is_ok());
        assert!(store.is_empty());
    }
}
