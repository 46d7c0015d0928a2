//! Session engine tests against an in-memory protocol store
//!
//! Covers the prekey handshake, the standard reply path, one-time prekey
//! consumption, redelivery of a first message, and identity pinning.

use std::{cell::RefCell, collections::HashMap};

use pinpoint_crypto::{
    CiphertextMessage, CryptoError, DoubleRatchetEngine, IdentityKeyPair, PreKeyRecord,
    ProtocolStore, SessionEngine, SessionRecord, SignedPreKeyRecord,
};
use pinpoint_proto::{IdentityKey, PeerAddress, PreKeyBundle, RegistrationId};
use proptest::prelude::*;
use rand_chacha::{ChaCha20Rng, rand_core::SeedableRng};

struct Device {
    address: PeerAddress,
    identity: IdentityKeyPair,
    registration_id: RegistrationId,
    prekeys: RefCell<HashMap<u32, PreKeyRecord>>,
    signed: SignedPreKeyRecord,
    identities: RefCell<HashMap<PeerAddress, IdentityKey>>,
    sessions: RefCell<HashMap<PeerAddress, SessionRecord>>,
}

impl Device {
    fn new(name: &str, rng: &mut ChaCha20Rng) -> Self {
        let engine = DoubleRatchetEngine;
        let identity = engine.generate_identity(rng);
        let signed = engine.generate_signed_prekey(&identity, 1, 1_000, rng);
        let prekeys = engine.generate_prekeys(1, 3, rng).into_iter().map(|k| (k.id, k)).collect();

        Self {
            address: PeerAddress::new(name, 1),
            registration_id: engine.generate_registration_id(rng),
            identity,
            prekeys: RefCell::new(prekeys),
            signed,
            identities: RefCell::new(HashMap::new()),
            sessions: RefCell::new(HashMap::new()),
        }
    }

    fn bundle(&self) -> PreKeyBundle {
        let prekey = self.prekeys.borrow().values().next().map(PreKeyRecord::public);
        PreKeyBundle {
            address: self.address.clone(),
            registration_id: self.registration_id,
            identity_key: self.identity.public(),
            prekey,
            signed_prekey: self.signed.public(),
        }
    }
}

impl ProtocolStore for Device {
    fn identity_key_pair(&self) -> Result<IdentityKeyPair, CryptoError> {
        Ok(self.identity.clone())
    }

    fn local_registration_id(&self) -> Result<RegistrationId, CryptoError> {
        Ok(self.registration_id)
    }

    fn is_trusted_identity(
        &self,
        peer: &PeerAddress,
        identity: &IdentityKey,
    ) -> Result<bool, CryptoError> {
        Ok(self.identities.borrow().get(peer).is_none_or(|known| known == identity))
    }

    fn save_identity(&self, peer: &PeerAddress, identity: &IdentityKey) -> Result<(), CryptoError> {
        self.identities.borrow_mut().insert(peer.clone(), *identity);
        Ok(())
    }

    fn load_session(&self, peer: &PeerAddress) -> Result<Option<SessionRecord>, CryptoError> {
        Ok(self.sessions.borrow().get(peer).cloned())
    }

    fn store_session(&self, peer: &PeerAddress, record: &SessionRecord) -> Result<(), CryptoError> {
        self.sessions.borrow_mut().insert(peer.clone(), record.clone());
        Ok(())
    }

    fn load_prekey(&self, id: u32) -> Result<Option<PreKeyRecord>, CryptoError> {
        Ok(self.prekeys.borrow().get(&id).cloned())
    }

    fn remove_prekey(&self, id: u32) -> Result<(), CryptoError> {
        self.prekeys.borrow_mut().remove(&id);
        Ok(())
    }

    fn load_signed_prekey(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
        Ok((self.signed.id == id).then(|| self.signed.clone()))
    }
}

fn setup(seed: u64) -> (Device, Device, ChaCha20Rng) {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let alice = Device::new("alice", &mut rng);
    let bob = Device::new("bob", &mut rng);
    (alice, bob, rng)
}

#[test]
fn prekey_message_then_standard_reply() {
    let (alice, bob, mut rng) = setup(1);
    let engine = DoubleRatchetEngine;

    engine.establish_session(&alice, &bob.address, &bob.bundle(), &mut rng).expect("establish");
    let first = engine.encrypt(&alice, &bob.address, b"ping", &mut rng).expect("encrypt");
    assert!(first.is_prekey());

    let plaintext = engine.decrypt(&bob, &alice.address, &first).expect("decrypt");
    assert_eq!(plaintext, b"ping");
    assert!(bob.sessions.borrow().contains_key(&alice.address));

    let reply = engine.encrypt(&bob, &alice.address, b"pong", &mut rng).expect("encrypt");
    assert!(!reply.is_prekey());
    assert_eq!(engine.decrypt(&alice, &bob.address, &reply).expect("decrypt"), b"pong");

    let second = engine.encrypt(&alice, &bob.address, b"again", &mut rng).expect("encrypt");
    assert!(matches!(second, CiphertextMessage::Standard(_)));
    assert_eq!(engine.decrypt(&bob, &alice.address, &second).expect("decrypt"), b"again");
}

#[test]
fn lost_first_message_does_not_strand_responder() {
    let (alice, bob, mut rng) = setup(7);
    let engine = DoubleRatchetEngine;

    engine.establish_session(&alice, &bob.address, &bob.bundle(), &mut rng).expect("establish");
    let _lost = engine.encrypt(&alice, &bob.address, b"one", &mut rng).expect("encrypt");
    let second = engine.encrypt(&alice, &bob.address, b"two", &mut rng).expect("encrypt");
    assert!(second.is_prekey());

    assert_eq!(engine.decrypt(&bob, &alice.address, &second).expect("decrypt"), b"two");
    let third = engine.encrypt(&alice, &bob.address, b"three", &mut rng).expect("encrypt");
    assert!(third.is_prekey());
    assert_eq!(engine.decrypt(&bob, &alice.address, &third).expect("decrypt"), b"three");
}

#[test]
fn crossing_handshakes_still_decrypt() {
    let (alice, bob, mut rng) = setup(8);
    let engine = DoubleRatchetEngine;

    engine.establish_session(&alice, &bob.address, &bob.bundle(), &mut rng).expect("establish");
    engine.establish_session(&bob, &alice.address, &alice.bundle(), &mut rng).expect("establish");
    let from_alice = engine.encrypt(&alice, &bob.address, b"a1", &mut rng).expect("encrypt");
    let from_bob = engine.encrypt(&bob, &alice.address, b"b1", &mut rng).expect("encrypt");

    assert_eq!(engine.decrypt(&bob, &alice.address, &from_alice).expect("decrypt"), b"a1");
    assert_eq!(engine.decrypt(&alice, &bob.address, &from_bob).expect("decrypt"), b"b1");

    // Each side now speaks on the other's handshake.
    let a2 = engine.encrypt(&alice, &bob.address, b"a2", &mut rng).expect("encrypt");
    let b2 = engine.encrypt(&bob, &alice.address, b"b2", &mut rng).expect("encrypt");
    assert_eq!(engine.decrypt(&bob, &alice.address, &a2).expect("decrypt"), b"a2");
    assert_eq!(engine.decrypt(&alice, &bob.address, &b2).expect("decrypt"), b"b2");

    let a3 = engine.encrypt(&alice, &bob.address, b"a3", &mut rng).expect("encrypt");
    assert_eq!(engine.decrypt(&bob, &alice.address, &a3).expect("decrypt"), b"a3");
    let record = bob.sessions.borrow().get(&alice.address).cloned().expect("session");
    assert_eq!(record.archived_states(), 1);
}

#[test]
fn inbound_handshake_consumes_one_time_prekey() {
    let (alice, bob, mut rng) = setup(2);
    let engine = DoubleRatchetEngine;
    let bundle = bob.bundle();
    let used = bundle.prekey.map(|p| p.id).expect("bundle has prekey");

    engine.establish_session(&alice, &bob.address, &bundle, &mut rng).expect("establish");
    let first = engine.encrypt(&alice, &bob.address, b"hi", &mut rng).expect("encrypt");
    engine.decrypt(&bob, &alice.address, &first).expect("decrypt");

    assert!(!bob.prekeys.borrow().contains_key(&used));
    assert_eq!(bob.prekeys.borrow().len(), 2);
}

#[test]
fn redelivered_prekey_message_is_a_duplicate_not_a_new_handshake() {
    let (alice, bob, mut rng) = setup(3);
    let engine = DoubleRatchetEngine;

    engine.establish_session(&alice, &bob.address, &bob.bundle(), &mut rng).expect("establish");
    let first = engine.encrypt(&alice, &bob.address, b"hi", &mut rng).expect("encrypt");
    engine.decrypt(&bob, &alice.address, &first).expect("decrypt");

    assert_eq!(engine.decrypt(&bob, &alice.address, &first), Err(CryptoError::DuplicateMessage));
    assert!(bob.sessions.borrow().contains_key(&alice.address));
}

#[test]
fn changed_bundle_identity_is_refused() {
    let (alice, bob, mut rng) = setup(4);
    let engine = DoubleRatchetEngine;

    engine.establish_session(&alice, &bob.address, &bob.bundle(), &mut rng).expect("establish");

    let reinstalled = Device::new("bob", &mut rng);
    let result = engine.establish_session(&alice, &bob.address, &reinstalled.bundle(), &mut rng);

    assert_eq!(
        result,
        Err(CryptoError::UntrustedIdentity {
            peer: bob.address.clone(),
            observed: reinstalled.identity.public(),
        })
    );
    assert_eq!(alice.identities.borrow().get(&bob.address), Some(&bob.identity.public()));
}

#[test]
fn changed_sender_identity_is_refused_on_receive() {
    let (alice, bob, mut rng) = setup(5);
    let engine = DoubleRatchetEngine;

    engine.establish_session(&alice, &bob.address, &bob.bundle(), &mut rng).expect("establish");
    let first = engine.encrypt(&alice, &bob.address, b"hi", &mut rng).expect("encrypt");
    engine.decrypt(&bob, &alice.address, &first).expect("decrypt");

    let impostor = Device::new("alice", &mut rng);
    engine.establish_session(&impostor, &bob.address, &bob.bundle(), &mut rng).expect("establish");
    let forged = engine.encrypt(&impostor, &bob.address, b"trust me", &mut rng).expect("encrypt");

    let result = engine.decrypt(&bob, &alice.address, &forged);
    assert!(matches!(result, Err(CryptoError::UntrustedIdentity { .. })));
}

#[test]
fn tampered_bundle_signature_is_rejected() {
    let (alice, bob, mut rng) = setup(6);
    let engine = DoubleRatchetEngine;
    let mut bundle = bob.bundle();
    bundle.signed_prekey.public_key[0] ^= 0xff;

    assert_eq!(
        engine.establish_session(&alice, &bob.address, &bundle, &mut rng),
        Err(CryptoError::InvalidSignature)
    );
    assert!(alice.sessions.borrow().is_empty());
}

#[test]
fn standard_message_without_session_fails() {
    let (alice, bob, mut rng) = setup(7);
    let engine = DoubleRatchetEngine;

    engine.establish_session(&alice, &bob.address, &bob.bundle(), &mut rng).expect("establish");
    let first = engine.encrypt(&alice, &bob.address, b"one", &mut rng).expect("encrypt");
    engine.decrypt(&bob, &alice.address, &first).expect("decrypt");
    let second = engine.encrypt(&alice, &bob.address, b"two", &mut rng).expect("encrypt");

    bob.sessions.borrow_mut().clear();
    assert_eq!(
        engine.decrypt(&bob, &alice.address, &second),
        Err(CryptoError::NoSession(alice.address.clone()))
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn arbitrary_conversations_decrypt(
        seed in any::<u64>(),
        turns in prop::collection::vec((any::<bool>(), prop::collection::vec(any::<u8>(), 0..64)), 1..20),
    ) {
        let (alice, bob, mut rng) = setup(seed);
        let engine = DoubleRatchetEngine;
        engine.establish_session(&alice, &bob.address, &bob.bundle(), &mut rng).expect("establish");

        let first = engine.encrypt(&alice, &bob.address, b"hello", &mut rng).expect("encrypt");
        prop_assert_eq!(engine.decrypt(&bob, &alice.address, &first).expect("decrypt"), b"hello".to_vec());

        for (from_alice, payload) in turns {
            let (sender, receiver) = if from_alice { (&alice, &bob) } else { (&bob, &alice) };
            let message = engine.encrypt(sender, &receiver.address, &payload, &mut rng).expect("encrypt");
            let decrypted = engine.decrypt(receiver, &sender.address, &message).expect("decrypt");
            prop_assert_eq!(decrypted, payload);
        }
    }
}
