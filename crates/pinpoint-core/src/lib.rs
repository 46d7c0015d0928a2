//! Pinpoint client core.
//!
//! Durable per-device state and the components that operate on it: the
//! namespaced secure store, session management with identity gating, key
//! rotation, the latest-only inbox, the delete-reconciliation ledger and the
//! live broadcast registry.
//!
//! # Architecture
//!
//! Nothing here caches state between calls. Every component is a short-lived
//! view borrowing a [`SecureStore`] (and, where it talks to the network, a
//! [`SessionEngine`](pinpoint_crypto::SessionEngine), an [`Environment`] and
//! a [`Directory`]). The store is the only shared mutable resource, so views
//! built for different operations never disagree about what is on disk.
//!
//! # Components
//!
//! - [`SecureStore`]: Typed key layout over a [`KeyValueStore`]
//! - [`SessionManager`]: Bundle path vs. existing session, identity consent
//! - [`KeyRotationScheduler`]: Prekey pool floor and signed prekey age
//! - [`MessageInbox`]: Latest message per sender
//! - [`DeleteLedger`]: Relay ids whose deletion can never succeed
//! - [`BroadcastRegistry`]: Outbound live-location shares
//! - [`Directory`]: Remote directory and relay contract

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod broadcast;
pub mod directory;
pub mod env;
pub mod inbox;
pub mod ledger;
pub mod rotation;
pub mod session;
pub mod storage;
pub mod store;

pub use broadcast::{BroadcastRegistry, LiveBroadcast};
pub use directory::Directory;
pub use env::{EnvRng, Environment};
pub use inbox::{InboxError, InboxSummary, MessageInbox, MessagePayload, StoredMessage, Summary};
pub use ledger::DeleteLedger;
pub use rotation::{KeyRotationScheduler, RotationError, RotationPolicy};
pub use session::{SealedMessage, SessionError, SessionManager};
pub use storage::{ChaoticStore, KeyValueStore, MemoryStore, RedbStore, StorageError};
pub use store::SecureStore;
