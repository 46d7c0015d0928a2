//! Session manager: chooses the bundle path or the existing-session path and
//! gates every identity change behind explicit consent.

use pinpoint_crypto::{CiphertextMessage, CryptoError, SessionEngine};
use pinpoint_proto::{ErrorKind, IdentityKey, PeerAddress, ProtocolError, RegistrationId, RemoteError};
use thiserror::Error;

use crate::{
    directory::Directory,
    env::{EnvRng, Environment},
    storage::{KeyValueStore, StorageError},
    store::SecureStore,
};

/// Session manager errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Peer identity changed. The observed key is pending consent.
    #[error("identity of {peer} changed; consent required")]
    AlteredIdentity {
        /// Peer whose identity changed
        peer: PeerAddress,
        /// Identity now pending
        observed: IdentityKey,
    },

    /// No local device exists.
    #[error("no local device")]
    NoLocalDevice,

    /// Directory returned a bundle for a different address.
    #[error("bundle for {got} returned when {expected} was requested")]
    BundleMismatch {
        /// Requested address
        expected: PeerAddress,
        /// Address in the bundle
        got: PeerAddress,
    },

    /// Session engine failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Directory failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Ciphertext could not be parsed.
    #[error(transparent)]
    Malformed(#[from] ProtocolError),
}

impl SessionError {
    /// Classify into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlteredIdentity { .. } => ErrorKind::AlteredIdentity,
            Self::NoLocalDevice => ErrorKind::NoLocalDevice,
            Self::BundleMismatch { .. } | Self::Malformed(_) => ErrorKind::Format,
            Self::Crypto(e) => e.kind(),
            Self::Remote(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}

/// An encrypted message ready for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// Encoded [`CiphertextMessage`].
    pub bytes: Vec<u8>,
    /// True if this message establishes the session.
    pub is_prekey: bool,
    /// Registration id the session was established against.
    pub recipient_registration_id: RegistrationId,
}

/// Transient view composing the store, engine, environment and directory.
pub struct SessionManager<'a, K: KeyValueStore, G: SessionEngine, E: Environment> {
    store: &'a SecureStore<K>,
    engine: &'a G,
    env: &'a E,
    directory: &'a dyn Directory,
}

impl<'a, K: KeyValueStore, G: SessionEngine, E: Environment> SessionManager<'a, K, G, E> {
    /// Borrow the collaborators for one operation.
    pub fn new(
        store: &'a SecureStore<K>,
        engine: &'a G,
        env: &'a E,
        directory: &'a dyn Directory,
    ) -> Self {
        Self { store, engine, env, directory }
    }

    /// Encrypt `plaintext` for `peer`.
    ///
    /// With a session, encrypts directly. Without one, fetches the peer's
    /// bundle, establishes a session and encrypts a prekey message. A changed
    /// identity fails with [`SessionError::AlteredIdentity`] and nothing is
    /// produced.
    pub async fn send(&self, peer: &PeerAddress, plaintext: &[u8]) -> Result<SealedMessage, SessionError> {
        let registration_id = self.local_registration_id()?;

        if !self.store.has_session(peer)? {
            self.establish(peer, registration_id).await?;
        }

        let mut rng = EnvRng::new(self.env);
        let message = self
            .engine
            .encrypt(self.store, peer, plaintext, &mut rng)
            .map_err(|e| self.identity_gate(e))?;

        let recipient_registration_id = self
            .store
            .session(peer)?
            .map(|session| session.remote_registration_id())
            .ok_or_else(|| CryptoError::NoSession(peer.clone()))?;

        Ok(SealedMessage {
            bytes: message.encode()?,
            is_prekey: message.is_prekey(),
            recipient_registration_id,
        })
    }

    /// Decrypt bytes received from `peer`. Prekey messages create the session.
    pub fn receive(&self, peer: &PeerAddress, bytes: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.local_registration_id()?;

        let message = CiphertextMessage::decode(bytes)?;
        let plaintext =
            self.engine.decrypt(self.store, peer, &message).map_err(|e| self.identity_gate(e))?;

        if message.is_prekey() {
            tracing::debug!(peer = %peer, "prekey message accepted");
        }
        Ok(plaintext)
    }

    /// Trust the pending identity of `peer`.
    ///
    /// Promotes exactly the key recorded when the change was detected and
    /// drops the stale session so the next send re-establishes. Returns
    /// `false` if nothing was pending.
    pub fn accept_new_identity(&self, peer: &PeerAddress) -> Result<bool, SessionError> {
        let Some(pending) = self.store.pending_identity(peer)? else {
            return Ok(false);
        };

        self.store.delete_session(peer)?;
        self.store.set_peer_identity(peer, &pending)?;
        self.store.clear_pending_identity(peer)?;

        tracing::info!(peer = %peer, fingerprint = %pending.fingerprint(), "accepted new identity");
        Ok(true)
    }

    /// True if a session with `peer` exists.
    pub fn has_session(&self, peer: &PeerAddress) -> Result<bool, SessionError> {
        Ok(self.store.has_session(peer)?)
    }

    /// Drop the session with `peer` without touching trust records.
    pub fn reset_session(&self, peer: &PeerAddress) -> Result<(), SessionError> {
        self.store.delete_session(peer)?;
        tracing::debug!(peer = %peer, "session reset");
        Ok(())
    }

    async fn establish(&self, peer: &PeerAddress, registration_id: RegistrationId) -> Result<(), SessionError> {
        let bundle = self.directory.fetch_prekey_bundle(peer, registration_id).await?;
        if bundle.address != *peer {
            return Err(SessionError::BundleMismatch { expected: peer.clone(), got: bundle.address });
        }

        let mut rng = EnvRng::new(self.env);
        self.engine
            .establish_session(self.store, peer, &bundle, &mut rng)
            .map_err(|e| self.identity_gate(e))?;

        tracing::info!(
            peer = %peer,
            one_time_prekey = bundle.prekey.is_some(),
            "outbound session established"
        );
        Ok(())
    }

    fn local_registration_id(&self) -> Result<RegistrationId, SessionError> {
        if !self.store.has_local_device()? {
            return Err(SessionError::NoLocalDevice);
        }
        self.store.registration_id()?.ok_or(SessionError::NoLocalDevice)
    }

    /// Record a changed identity as pending and surface it.
    fn identity_gate(&self, error: CryptoError) -> SessionError {
        let CryptoError::UntrustedIdentity { peer, observed } = error else {
            return error.into();
        };

        if let Err(e) = self.store.set_pending_identity(&peer, &observed) {
            return e.into();
        }

        tracing::warn!(peer = %peer, fingerprint = %observed.fingerprint(), "identity change detected");
        SessionError::AlteredIdentity { peer, observed }
    }
}
