//! Namespaced secure store for one local device.
//!
//! Every key lives under `<combined id>/` of the local address, so several
//! local devices can share one backing store without seeing each other's
//! state. Values are CBOR. A value that fails to decode is deleted on the
//! spot and reported as [`StorageError::Corrupt`]; callers never observe
//! partial state.
//!
//! # Key layout
//!
//! ```text
//! <local>/identity                  IdentityKeyPair
//! <local>/registration              RegistrationId
//! <local>/prekey:<id>               PreKeyRecord
//! <local>/prekeyMaxId               u32
//! <local>/pendingPrekeys            Vec<u32>
//! <local>/signedPrekey:<id>         SignedPreKeyRecord
//! <local>/pendingSignedPrekey       u32
//! <local>/session:<peerHash>        SessionRecord
//! <local>/peerIdentity:<peerId>     IdentityKey
//! <local>/pendingIdentity:<peerId>  IdentityKey
//! <local>/msg:<peerId>              StoredMessage
//! <local>/liveBroadcasts            Vec<LiveBroadcast>
//! <local>/failedDeletes             BTreeSet<u64>
//! ```

use pinpoint_crypto::{
    CryptoError, IdentityKeyPair, PreKeyRecord, ProtocolStore, SessionRecord, SignedPreKeyRecord,
};
use pinpoint_proto::{IdentityKey, PeerAddress, RegistrationId};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

use crate::storage::{KeyValueStore, StorageError};

pub(crate) const IDENTITY: &str = "identity";
pub(crate) const REGISTRATION: &str = "registration";
pub(crate) const PREKEY_PREFIX: &str = "prekey:";
pub(crate) const PREKEY_MAX_ID: &str = "prekeyMaxId";
pub(crate) const PENDING_PREKEYS: &str = "pendingPrekeys";
pub(crate) const SIGNED_PREKEY_PREFIX: &str = "signedPrekey:";
pub(crate) const PENDING_SIGNED_PREKEY: &str = "pendingSignedPrekey";
pub(crate) const SESSION_PREFIX: &str = "session:";
pub(crate) const PEER_IDENTITY_PREFIX: &str = "peerIdentity:";
pub(crate) const PENDING_IDENTITY_PREFIX: &str = "pendingIdentity:";
pub(crate) const MESSAGE_PREFIX: &str = "msg:";
pub(crate) const LIVE_BROADCASTS: &str = "liveBroadcasts";
pub(crate) const FAILED_DELETES: &str = "failedDeletes";

/// Typed, namespaced view over a [`KeyValueStore`].
#[derive(Clone)]
pub struct SecureStore<K: KeyValueStore> {
    kv: K,
    local: PeerAddress,
    namespace: String,
}

impl<K: KeyValueStore> SecureStore<K> {
    /// Scope `kv` to the local device `local`.
    pub fn new(kv: K, local: PeerAddress) -> Self {
        let namespace = format!("{}/", local.combined_id());
        Self { kv, local, namespace }
    }

    /// Local device address.
    pub fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    /// Backing store.
    pub fn backend(&self) -> &K {
        &self.kv
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    /// Load and decode `key`. Undecodable values are deleted and reported.
    pub(crate) fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let full_key = self.full_key(key);
        let Some(bytes) = self.kv.get(&full_key)? else {
            return Ok(None);
        };

        match ciborium::from_reader(bytes.as_slice()) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding corrupt entry");
                self.kv.delete(&full_key)?;
                Err(StorageError::Corrupt { key: key.to_string(), reason: e.to_string() })
            },
        }
    }

    /// Encode and store `value` under `key`.
    pub(crate) fn set_value<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.kv.set(&self.full_key(key), &bytes)
    }

    pub(crate) fn delete_value(&self, key: &str) -> Result<(), StorageError> {
        self.kv.delete(&self.full_key(key))
    }

    /// Keys (without namespace) that start with `prefix`.
    pub(crate) fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let full_prefix = self.full_key(prefix);
        Ok(self
            .kv
            .list_keys_with_prefix(&full_prefix)?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.namespace).map(str::to_string))
            .collect())
    }

    /// Numeric ids of keys `prefix<id>`. Keys with a non-numeric suffix are
    /// deleted as corrupt.
    fn ids_with_prefix(&self, prefix: &str) -> Result<Vec<u32>, StorageError> {
        let mut ids = Vec::new();
        for key in self.keys_with_prefix(prefix)? {
            match key.strip_prefix(prefix).and_then(|id| id.parse().ok()) {
                Some(id) => ids.push(id),
                None => {
                    tracing::warn!(key, "discarding entry with malformed id");
                    self.delete_value(&key)?;
                },
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    // Local device

    /// True once a device has been created and persisted locally.
    pub fn has_local_device(&self) -> Result<bool, StorageError> {
        Ok(self.kv.get(&self.full_key(IDENTITY))?.is_some()
            && self.kv.get(&self.full_key(REGISTRATION))?.is_some())
    }

    /// Local identity key pair.
    pub fn identity(&self) -> Result<Option<IdentityKeyPair>, StorageError> {
        self.get_value(IDENTITY)
    }

    /// Persist the local identity key pair.
    pub fn set_identity(&self, identity: &IdentityKeyPair) -> Result<(), StorageError> {
        self.set_value(IDENTITY, identity)
    }

    /// Local registration id.
    pub fn registration_id(&self) -> Result<Option<RegistrationId>, StorageError> {
        self.get_value(REGISTRATION)
    }

    /// Persist the local registration id.
    pub fn set_registration_id(&self, id: RegistrationId) -> Result<(), StorageError> {
        self.set_value(REGISTRATION, &id)
    }

    // One-time prekeys

    /// Persist a one-time prekey.
    pub fn store_prekey(&self, record: &PreKeyRecord) -> Result<(), StorageError> {
        self.set_value(&format!("{PREKEY_PREFIX}{}", record.id), record)
    }

    /// One-time prekey by id.
    pub fn prekey(&self, id: u32) -> Result<Option<PreKeyRecord>, StorageError> {
        self.get_value(&format!("{PREKEY_PREFIX}{id}"))
    }

    /// Delete a one-time prekey.
    pub fn remove_prekey(&self, id: u32) -> Result<(), StorageError> {
        self.delete_value(&format!("{PREKEY_PREFIX}{id}"))
    }

    /// Ids of unconsumed one-time prekeys, ascending.
    pub fn prekey_ids(&self) -> Result<Vec<u32>, StorageError> {
        self.ids_with_prefix(PREKEY_PREFIX)
    }

    /// Highest prekey id ever assigned.
    pub fn prekey_max_id(&self) -> Result<Option<u32>, StorageError> {
        self.get_value(PREKEY_MAX_ID)
    }

    /// Record the highest prekey id ever assigned.
    pub fn set_prekey_max_id(&self, id: u32) -> Result<(), StorageError> {
        self.set_value(PREKEY_MAX_ID, &id)
    }

    /// Prekey ids generated but not yet confirmed uploaded.
    pub fn pending_prekey_upload(&self) -> Result<Vec<u32>, StorageError> {
        Ok(self.get_value(PENDING_PREKEYS)?.unwrap_or_default())
    }

    /// Mark `ids` as awaiting upload.
    pub fn set_pending_prekey_upload(&self, ids: &[u32]) -> Result<(), StorageError> {
        self.set_value(PENDING_PREKEYS, &ids)
    }

    /// Forget the pending prekey upload.
    pub fn clear_pending_prekey_upload(&self) -> Result<(), StorageError> {
        self.delete_value(PENDING_PREKEYS)
    }

    // Signed prekeys

    /// Persist a signed prekey.
    pub fn store_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), StorageError> {
        self.set_value(&format!("{SIGNED_PREKEY_PREFIX}{}", record.id), record)
    }

    /// Signed prekey by id.
    pub fn signed_prekey(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, StorageError> {
        self.get_value(&format!("{SIGNED_PREKEY_PREFIX}{id}"))
    }

    /// Delete a signed prekey.
    pub fn remove_signed_prekey(&self, id: u32) -> Result<(), StorageError> {
        self.delete_value(&format!("{SIGNED_PREKEY_PREFIX}{id}"))
    }

    /// Ids of held signed prekeys, ascending. The last is current.
    pub fn signed_prekey_ids(&self) -> Result<Vec<u32>, StorageError> {
        self.ids_with_prefix(SIGNED_PREKEY_PREFIX)
    }

    /// Signed prekey id generated but not yet confirmed uploaded.
    pub fn pending_signed_prekey_upload(&self) -> Result<Option<u32>, StorageError> {
        self.get_value(PENDING_SIGNED_PREKEY)
    }

    /// Mark signed prekey `id` as awaiting upload.
    pub fn set_pending_signed_prekey_upload(&self, id: u32) -> Result<(), StorageError> {
        self.set_value(PENDING_SIGNED_PREKEY, &id)
    }

    /// Forget the pending signed prekey upload.
    pub fn clear_pending_signed_prekey_upload(&self) -> Result<(), StorageError> {
        self.delete_value(PENDING_SIGNED_PREKEY)
    }

    // Sessions

    fn session_key(peer: &PeerAddress) -> String {
        let digest = Sha256::digest(peer.combined_id().as_bytes());
        format!("{SESSION_PREFIX}{}", hex::encode(&digest[..16]))
    }

    /// Session with `peer`.
    pub fn session(&self, peer: &PeerAddress) -> Result<Option<SessionRecord>, StorageError> {
        self.get_value(&Self::session_key(peer))
    }

    /// Overwrite the session with `peer`.
    pub fn store_session(&self, peer: &PeerAddress, record: &SessionRecord) -> Result<(), StorageError> {
        self.set_value(&Self::session_key(peer), record)
    }

    /// Delete the session with `peer`.
    pub fn delete_session(&self, peer: &PeerAddress) -> Result<(), StorageError> {
        self.delete_value(&Self::session_key(peer))
    }

    /// True if a session with `peer` is stored. Does not decode it.
    pub fn has_session(&self, peer: &PeerAddress) -> Result<bool, StorageError> {
        Ok(self.kv.get(&self.full_key(&Self::session_key(peer)))?.is_some())
    }

    // Peer identities

    /// Trusted identity of `peer`.
    pub fn peer_identity(&self, peer: &PeerAddress) -> Result<Option<IdentityKey>, StorageError> {
        self.get_value(&format!("{PEER_IDENTITY_PREFIX}{}", peer.combined_id()))
    }

    /// Overwrite the trusted identity of `peer`.
    pub fn set_peer_identity(&self, peer: &PeerAddress, identity: &IdentityKey) -> Result<(), StorageError> {
        self.set_value(&format!("{PEER_IDENTITY_PREFIX}{}", peer.combined_id()), identity)
    }

    /// Changed identity observed for `peer` and awaiting consent.
    pub fn pending_identity(&self, peer: &PeerAddress) -> Result<Option<IdentityKey>, StorageError> {
        self.get_value(&format!("{PENDING_IDENTITY_PREFIX}{}", peer.combined_id()))
    }

    /// Record a changed identity for `peer`, replacing any earlier one.
    pub fn set_pending_identity(
        &self,
        peer: &PeerAddress,
        identity: &IdentityKey,
    ) -> Result<(), StorageError> {
        self.set_value(&format!("{PENDING_IDENTITY_PREFIX}{}", peer.combined_id()), identity)
    }

    /// Forget the pending identity of `peer`.
    pub fn clear_pending_identity(&self, peer: &PeerAddress) -> Result<(), StorageError> {
        self.delete_value(&format!("{PENDING_IDENTITY_PREFIX}{}", peer.combined_id()))
    }

    /// Delete every key in this namespace.
    pub fn wipe(&self) -> Result<usize, StorageError> {
        let keys = self.kv.list_keys_with_prefix(&self.namespace)?;
        for key in &keys {
            self.kv.delete(key)?;
        }
        Ok(keys.len())
    }
}

fn crypto_error(error: StorageError) -> CryptoError {
    match error {
        StorageError::Corrupt { key, reason } => CryptoError::CorruptState(format!("{key}: {reason}")),
        StorageError::Io(message) | StorageError::Serialization(message) => {
            CryptoError::Storage(message)
        },
    }
}

impl<K: KeyValueStore> ProtocolStore for SecureStore<K> {
    fn identity_key_pair(&self) -> Result<IdentityKeyPair, CryptoError> {
        self.identity()
            .map_err(crypto_error)?
            .ok_or_else(|| CryptoError::Storage("no local identity".to_string()))
    }

    fn local_registration_id(&self) -> Result<RegistrationId, CryptoError> {
        self.registration_id()
            .map_err(crypto_error)?
            .ok_or_else(|| CryptoError::Storage("no local registration id".to_string()))
    }

    fn is_trusted_identity(
        &self,
        peer: &PeerAddress,
        identity: &IdentityKey,
    ) -> Result<bool, CryptoError> {
        let known = self.peer_identity(peer).map_err(crypto_error)?;
        Ok(known.is_none_or(|known| known == *identity))
    }

    fn save_identity(&self, peer: &PeerAddress, identity: &IdentityKey) -> Result<(), CryptoError> {
        self.set_peer_identity(peer, identity).map_err(crypto_error)
    }

    fn load_session(&self, peer: &PeerAddress) -> Result<Option<SessionRecord>, CryptoError> {
        self.session(peer).map_err(crypto_error)
    }

    fn store_session(&self, peer: &PeerAddress, record: &SessionRecord) -> Result<(), CryptoError> {
        SecureStore::store_session(self, peer, record).map_err(crypto_error)
    }

    fn load_prekey(&self, id: u32) -> Result<Option<PreKeyRecord>, CryptoError> {
        self.prekey(id).map_err(crypto_error)
    }

    fn remove_prekey(&self, id: u32) -> Result<(), CryptoError> {
        SecureStore::remove_prekey(self, id).map_err(crypto_error)
    }

    fn load_signed_prekey(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
        self.signed_prekey(id).map_err(crypto_error)
    }
}
