//! Session engine: handshake, encryption and decryption against a store.

use pinpoint_proto::{IdentityKey, PeerAddress, PreKeyBundle, RegistrationId};
use rand_core::{CryptoRng, RngCore};

use crate::{
    CryptoError,
    keys::{
        IdentityKeyPair, PreKeyRecord, SignedPreKeyRecord, generate_prekeys,
        generate_registration_id, verify_signed_prekey,
    },
    message::{CiphertextMessage, PreKeyMessage, StandardMessage},
    ratchet::RatchetState,
    session::{PendingPreKey, SessionRecord, SessionState, associated_data},
    x3dh,
};

/// Key material the engine reads and writes.
///
/// Implementations give atomic single-key reads and writes. The engine orders
/// multi-key updates so that a retry after a partial failure is safe.
pub trait ProtocolStore {
    /// Local identity key pair.
    fn identity_key_pair(&self) -> Result<IdentityKeyPair, CryptoError>;

    /// Local registration id.
    fn local_registration_id(&self) -> Result<RegistrationId, CryptoError>;

    /// True if `identity` matches the stored record for `peer`, or no record
    /// exists yet.
    fn is_trusted_identity(
        &self,
        peer: &PeerAddress,
        identity: &IdentityKey,
    ) -> Result<bool, CryptoError>;

    /// Record `identity` as the trusted identity of `peer`.
    fn save_identity(&self, peer: &PeerAddress, identity: &IdentityKey) -> Result<(), CryptoError>;

    /// Session for `peer`, if any.
    fn load_session(&self, peer: &PeerAddress) -> Result<Option<SessionRecord>, CryptoError>;

    /// Overwrite the session for `peer`.
    fn store_session(&self, peer: &PeerAddress, record: &SessionRecord) -> Result<(), CryptoError>;

    /// One-time prekey by id.
    fn load_prekey(&self, id: u32) -> Result<Option<PreKeyRecord>, CryptoError>;

    /// Delete a consumed one-time prekey. Deleting a missing id is not an
    /// error.
    fn remove_prekey(&self, id: u32) -> Result<(), CryptoError>;

    /// Signed prekey by id.
    fn load_signed_prekey(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError>;
}

/// Opaque session algebra used by the session manager.
pub trait SessionEngine: Clone + Send + Sync + 'static {
    /// Create an outbound session for `peer` from its published bundle.
    fn establish_session<S: ProtocolStore, R: RngCore + CryptoRng>(
        &self,
        store: &S,
        peer: &PeerAddress,
        bundle: &PreKeyBundle,
        rng: &mut R,
    ) -> Result<(), CryptoError>;

    /// Encrypt on the existing session for `peer`.
    fn encrypt<S: ProtocolStore, R: RngCore + CryptoRng>(
        &self,
        store: &S,
        peer: &PeerAddress,
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<CiphertextMessage, CryptoError>;

    /// Decrypt a message from `peer`, creating a session for prekey messages.
    fn decrypt<S: ProtocolStore>(
        &self,
        store: &S,
        peer: &PeerAddress,
        message: &CiphertextMessage,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Generate a long-term identity.
    fn generate_identity<R: RngCore + CryptoRng>(&self, rng: &mut R) -> IdentityKeyPair {
        IdentityKeyPair::generate(rng)
    }

    /// Generate a registration id.
    fn generate_registration_id<R: RngCore + CryptoRng>(&self, rng: &mut R) -> RegistrationId {
        generate_registration_id(rng)
    }

    /// Generate `count` one-time prekeys with ids from `start_id`.
    fn generate_prekeys<R: RngCore + CryptoRng>(
        &self,
        start_id: u32,
        count: u32,
        rng: &mut R,
    ) -> Vec<PreKeyRecord> {
        generate_prekeys(start_id, count, rng)
    }

    /// Generate a signed prekey.
    fn generate_signed_prekey<R: RngCore + CryptoRng>(
        &self,
        identity: &IdentityKeyPair,
        id: u32,
        now_ms: u64,
        rng: &mut R,
    ) -> SignedPreKeyRecord {
        SignedPreKeyRecord::generate(identity, id, now_ms, rng)
    }
}

/// X3DH handshake followed by a double ratchet.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleRatchetEngine;

impl DoubleRatchetEngine {
    /// Decrypt with one state, committing the new ratchet only on success.
    fn decrypt_with(state: &mut SessionState, message: &StandardMessage) -> Result<Vec<u8>, CryptoError> {
        let mut ratchet = state.ratchet.clone();
        let plaintext = ratchet.decrypt(&message.header, &message.ciphertext, &state.associated_data)?;
        state.ratchet = ratchet;
        Ok(plaintext)
    }

    /// Try the current state, then superseded ones. A superseded state that
    /// decrypts becomes current. If none decrypts, the current state's error
    /// is returned.
    fn decrypt_record(
        record: &mut SessionRecord,
        message: &StandardMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let error = match Self::decrypt_with(&mut record.current, message) {
            Ok(plaintext) => return Ok(plaintext),
            Err(CryptoError::DuplicateMessage) => return Err(CryptoError::DuplicateMessage),
            Err(e) => e,
        };

        for index in 0..record.previous.len() {
            match Self::decrypt_with(&mut record.previous[index], message) {
                Ok(plaintext) => {
                    let state = record.previous.remove(index);
                    record.promote(state);
                    return Ok(plaintext);
                },
                Err(CryptoError::DuplicateMessage) => return Err(CryptoError::DuplicateMessage),
                Err(_) => {},
            }
        }

        Err(error)
    }

    fn ensure_trusted<S: ProtocolStore>(
        store: &S,
        peer: &PeerAddress,
        identity: &IdentityKey,
    ) -> Result<(), CryptoError> {
        if store.is_trusted_identity(peer, identity)? {
            Ok(())
        } else {
            Err(CryptoError::UntrustedIdentity { peer: peer.clone(), observed: *identity })
        }
    }

    fn decrypt_prekey<S: ProtocolStore>(
        store: &S,
        peer: &PeerAddress,
        message: &PreKeyMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        Self::ensure_trusted(store, peer, &message.identity_key)?;
        let existing = store.load_session(peer)?;

        // Repeated handshake of a session we already hold.
        if let Some(mut record) = existing.clone() {
            if record.current.base_key == message.base_key {
                let plaintext = Self::decrypt_with(&mut record.current, &message.message)?;
                store.store_session(peer, &record)?;
                return Ok(plaintext);
            }
            if let Some(index) =
                record.previous.iter().position(|state| state.base_key == message.base_key)
            {
                let plaintext = Self::decrypt_with(&mut record.previous[index], &message.message)?;
                let state = record.previous.remove(index);
                record.promote(state);
                store.store_session(peer, &record)?;
                return Ok(plaintext);
            }
        }

        let identity = store.identity_key_pair()?;
        let signed = store
            .load_signed_prekey(message.signed_prekey_id)?
            .ok_or(CryptoError::MissingSignedPreKey(message.signed_prekey_id))?;
        let one_time = match message.prekey_id {
            Some(id) => Some(store.load_prekey(id)?.ok_or(CryptoError::MissingPreKey(id))?),
            None => None,
        };

        let secret = x3dh::respond(
            &identity,
            &signed,
            one_time.as_ref(),
            &message.identity_key.dh,
            &message.base_key,
        );

        let mut state = SessionState {
            ratchet: RatchetState::init_receiver(secret, &signed.dh()),
            remote_identity: message.identity_key,
            remote_registration_id: message.registration_id,
            base_key: message.base_key,
            associated_data: associated_data(&message.identity_key, &identity.public()),
            pending_prekey: None,
        };
        let plaintext = Self::decrypt_with(&mut state, &message.message)?;

        // A crossing handshake of our own stays decryptable.
        let record = match existing {
            Some(mut record) => {
                record.promote(state);
                record
            },
            None => SessionRecord::new(state),
        };

        store.save_identity(peer, &message.identity_key)?;
        store.store_session(peer, &record)?;
        if let Some(id) = message.prekey_id {
            store.remove_prekey(id)?;
        }

        Ok(plaintext)
    }
}

impl SessionEngine for DoubleRatchetEngine {
    fn establish_session<S: ProtocolStore, R: RngCore + CryptoRng>(
        &self,
        store: &S,
        peer: &PeerAddress,
        bundle: &PreKeyBundle,
        rng: &mut R,
    ) -> Result<(), CryptoError> {
        verify_signed_prekey(&bundle.identity_key, &bundle.signed_prekey)?;
        Self::ensure_trusted(store, peer, &bundle.identity_key)?;

        let identity = store.identity_key_pair()?;
        let initiated = x3dh::initiate(
            &identity,
            &bundle.identity_key.dh,
            &bundle.signed_prekey.public_key,
            bundle.prekey.as_ref().map(|prekey| &prekey.public_key),
            rng,
        );

        let record = SessionRecord::new(SessionState {
            ratchet: RatchetState::init_sender(initiated.secret, bundle.signed_prekey.public_key, rng),
            remote_identity: bundle.identity_key,
            remote_registration_id: bundle.registration_id,
            base_key: initiated.base_key,
            associated_data: associated_data(&identity.public(), &bundle.identity_key),
            pending_prekey: Some(PendingPreKey {
                prekey_id: bundle.prekey.map(|prekey| prekey.id),
                signed_prekey_id: bundle.signed_prekey.id,
            }),
        });

        store.save_identity(peer, &bundle.identity_key)?;
        store.store_session(peer, &record)
    }

    fn encrypt<S: ProtocolStore, R: RngCore + CryptoRng>(
        &self,
        store: &S,
        peer: &PeerAddress,
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<CiphertextMessage, CryptoError> {
        let mut record =
            store.load_session(peer)?.ok_or_else(|| CryptoError::NoSession(peer.clone()))?;
        Self::ensure_trusted(store, peer, record.remote_identity())?;

        let current = &mut record.current;
        let (header, ciphertext) = current.ratchet.encrypt(plaintext, &current.associated_data, rng)?;
        let standard = StandardMessage { header, ciphertext };

        // Every message carries the handshake until the peer has replied, so
        // a lost first message never strands the responder without a session.
        let message = match current.pending_prekey {
            Some(pending) => CiphertextMessage::PreKey(PreKeyMessage {
                registration_id: store.local_registration_id()?,
                prekey_id: pending.prekey_id,
                signed_prekey_id: pending.signed_prekey_id,
                base_key: current.base_key,
                identity_key: store.identity_key_pair()?.public(),
                message: standard,
            }),
            None => CiphertextMessage::Standard(standard),
        };

        store.store_session(peer, &record)?;
        Ok(message)
    }

    fn decrypt<S: ProtocolStore>(
        &self,
        store: &S,
        peer: &PeerAddress,
        message: &CiphertextMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        match message {
            CiphertextMessage::PreKey(prekey) => Self::decrypt_prekey(store, peer, prekey),
            CiphertextMessage::Standard(standard) => {
                let mut record =
                    store.load_session(peer)?.ok_or_else(|| CryptoError::NoSession(peer.clone()))?;
                Self::ensure_trusted(store, peer, record.remote_identity())?;

                let plaintext = Self::decrypt_record(&mut record, standard)?;
                // The peer has replied on the state that is now current.
                record.current.pending_prekey = None;
                store.store_session(peer, &record)?;
                Ok(plaintext)
            },
        }
    }
}
