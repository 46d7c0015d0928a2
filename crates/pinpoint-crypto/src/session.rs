//! Persisted per-peer session record.

use pinpoint_proto::{IdentityKey, RegistrationId};
use serde::{Deserialize, Serialize};

use crate::ratchet::RatchetState;

/// Maximum superseded states kept per peer.
pub(crate) const ARCHIVED_STATE_LIMIT: usize = 10;

/// Handshake parameters the initiator attaches to its first message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PendingPreKey {
    pub prekey_id: Option<u32>,
    pub signed_prekey_id: u32,
}

/// One handshake's ratchet plus the facts needed to validate its traffic.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct SessionState {
    pub ratchet: RatchetState,
    pub remote_identity: IdentityKey,
    pub remote_registration_id: RegistrationId,
    pub base_key: [u8; 32],
    pub associated_data: Vec<u8>,
    pub pending_prekey: Option<PendingPreKey>,
}

/// Current session with a peer and the states it superseded.
///
/// When both devices start a handshake at the same time each side ends up
/// with the other's session as current. Superseded states stay decryptable,
/// and a state that decrypts becomes current again, so the two sides
/// converge on whichever handshake carried the latest traffic.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub(crate) current: SessionState,
    pub(crate) previous: Vec<SessionState>,
}

impl SessionRecord {
    pub(crate) fn new(current: SessionState) -> Self {
        Self { current, previous: Vec::new() }
    }

    /// Make `state` current, keeping the old current first in line.
    pub(crate) fn promote(&mut self, state: SessionState) {
        let superseded = std::mem::replace(&mut self.current, state);
        self.previous.insert(0, superseded);
        self.previous.truncate(ARCHIVED_STATE_LIMIT);
    }

    /// Identity the session was established with.
    pub fn remote_identity(&self) -> &IdentityKey {
        &self.current.remote_identity
    }

    /// Registration id of the remote device at establishment.
    pub fn remote_registration_id(&self) -> RegistrationId {
        self.current.remote_registration_id
    }

    /// Handshake base key. Identifies the handshake that created the session.
    pub fn base_key(&self) -> &[u8; 32] {
        &self.current.base_key
    }

    /// True on an outbound session until the peer's first reply decrypts.
    /// Until then every outgoing message is a prekey message.
    pub fn awaiting_reply(&self) -> bool {
        self.current.pending_prekey.is_some()
    }

    /// Number of superseded states still accepted for decryption.
    pub fn archived_states(&self) -> usize {
        self.previous.len()
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("remote_identity", &self.current.remote_identity)
            .field("remote_registration_id", &self.current.remote_registration_id)
            .field("awaiting_reply", &self.awaiting_reply())
            .field("archived_states", &self.previous.len())
            .finish_non_exhaustive()
    }
}

/// Associated data binding both identities, initiator first.
pub(crate) fn associated_data(initiator: &IdentityKey, responder: &IdentityKey) -> Vec<u8> {
    let mut ad = Vec::with_capacity(128);
    ad.extend_from_slice(&initiator.dh);
    ad.extend_from_slice(&initiator.signing);
    ad.extend_from_slice(&responder.dh);
    ad.extend_from_slice(&responder.signing);
    ad
}
