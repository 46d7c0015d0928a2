//! Key-value storage abstraction
//!
//! The platform secure-storage API reduced to four operations on opaque
//! byte values. The trait is synchronous (no async): every implementation
//! gives atomic single-key reads and writes and nothing more. Callers order
//! multi-key updates so that a retry after a partial failure is safe.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStore;
pub use error::StorageError;
pub use memory::MemoryStore;

pub use self::redb::RedbStore;

/// Opaque byte store keyed by string
///
/// Must be Clone (shared by every component of a messenger), Send + Sync
/// (thread-safe), and synchronous. Implementations share internal state via
/// Arc, so clones access the same underlying storage.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned (a thread panicked while holding a lock). Acceptable for
/// test/simulation code, but production implementations should handle poisoned
/// mutexes gracefully.
pub trait KeyValueStore: Clone + Send + Sync + 'static {
    /// Value under `key`. `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Overwrite the value under `key`.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, in ascending order.
    fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
