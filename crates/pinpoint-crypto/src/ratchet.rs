//! Double ratchet state for one peer.
//!
//! # Security Properties
//!
//! - Forward Secrecy: chain keys are replaced after every message
//! - Post-Compromise Security: each change of speaker runs a fresh DH step
//! - Out-of-order delivery: skipped message keys are retained, bounded

use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{
    CryptoError,
    aead::{open, seal},
    kdf::{kdf_chain, kdf_root},
};

/// Maximum number of message keys skipped in a single chain.
const MAX_SKIP: u32 = 1000;

/// Maximum number of skipped message keys retained across chains.
const MAX_STORED_SKIPPED: usize = 2000;

/// Public header attached to every ratchet message. Authenticated, not
/// encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Sender's current ratchet public key.
    pub dh_pub: [u8; 32],
    /// Message number in the current sending chain.
    pub msg_num: u32,
    /// Length of the sender's previous sending chain.
    pub prev_chain_len: u32,
}

impl Header {
    /// 40-byte encoding used as associated data.
    pub fn serialized(&self) -> [u8; 40] {
        let mut aad = [0u8; 40];
        aad[0..32].copy_from_slice(&self.dh_pub);
        aad[32..36].copy_from_slice(&self.msg_num.to_be_bytes());
        aad[36..40].copy_from_slice(&self.prev_chain_len.to_be_bytes());
        aad
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh_pub: [u8; 32],
    msg_num: u32,
    key: [u8; 32],
}

/// Ratchet state. Cloned before decryption so a failed message leaves the
/// stored state untouched.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: [u8; 32],
    sending_chain: Option<[u8; 32]>,
    receiving_chain: Option<[u8; 32]>,
    dh_self: [u8; 32],
    dh_remote: Option<[u8; 32]>,
    msg_send: u32,
    msg_recv: u32,
    prev_chain_len: u32,
    skipped: Vec<SkippedKey>,
}

impl RatchetState {
    /// Initialize the side that sends first, against the responder's signed
    /// prekey.
    pub(crate) fn init_sender<R: RngCore + CryptoRng>(
        secret: [u8; 32],
        remote_pub: [u8; 32],
        rng: &mut R,
    ) -> Self {
        let dh_self = StaticSecret::random_from_rng(&mut *rng);
        let dh_out = dh_self.diffie_hellman(&PublicKey::from(remote_pub)).to_bytes();
        let (root_key, sending_chain) = kdf_root(&secret, &dh_out);

        Self {
            root_key,
            sending_chain: Some(sending_chain),
            receiving_chain: None,
            dh_self: dh_self.to_bytes(),
            dh_remote: Some(remote_pub),
            msg_send: 0,
            msg_recv: 0,
            prev_chain_len: 0,
            skipped: Vec::new(),
        }
    }

    /// Initialize the responder. Chains are derived on the first message.
    pub(crate) fn init_receiver(secret: [u8; 32], signed_prekey: &StaticSecret) -> Self {
        Self {
            root_key: secret,
            sending_chain: None,
            receiving_chain: None,
            dh_self: signed_prekey.to_bytes(),
            dh_remote: None,
            msg_send: 0,
            msg_recv: 0,
            prev_chain_len: 0,
            skipped: Vec::new(),
        }
    }

    /// Number of skipped message keys currently retained.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt `plaintext`, running a DH step first if the peer spoke last.
    pub(crate) fn encrypt<R: RngCore + CryptoRng>(
        &mut self,
        plaintext: &[u8],
        associated_data: &[u8],
        rng: &mut R,
    ) -> Result<(Header, Vec<u8>), CryptoError> {
        let chain = match self.sending_chain {
            Some(chain) => chain,
            None => self.dh_ratchet_send(rng)?,
        };

        let (next_chain, mut message_key) = kdf_chain(&chain);
        self.sending_chain = Some(next_chain);

        let header = Header {
            dh_pub: PublicKey::from(&StaticSecret::from(self.dh_self)).to_bytes(),
            msg_num: self.msg_send,
            prev_chain_len: self.prev_chain_len,
        };
        self.msg_send = self
            .msg_send
            .checked_add(1)
            .ok_or_else(|| CryptoError::CorruptState("sending chain exhausted".to_string()))?;

        let ciphertext = seal(&message_key, plaintext, &aad(associated_data, &header));
        message_key.zeroize();
        Ok((header, ciphertext))
    }

    /// Decrypt a message. On error the state may be partially advanced, so
    /// callers decrypt on a clone and persist only on success.
    pub(crate) fn decrypt(
        &mut self,
        header: &Header,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let aad = aad(associated_data, header);

        if let Some(position) = self
            .skipped
            .iter()
            .position(|k| k.dh_pub == header.dh_pub && k.msg_num == header.msg_num)
        {
            let mut skipped = self.skipped.remove(position);
            let result = open(&skipped.key, ciphertext, &aad);
            skipped.key.zeroize();
            return result;
        }

        if self.dh_remote == Some(header.dh_pub) && header.msg_num < self.msg_recv {
            return Err(CryptoError::DuplicateMessage);
        }

        if self.dh_remote != Some(header.dh_pub) {
            if self.receiving_chain.is_some() {
                self.skip_message_keys(header.prev_chain_len)?;
            }
            self.dh_ratchet_receive(header.dh_pub);
        }

        self.skip_message_keys(header.msg_num)?;

        let chain = self
            .receiving_chain
            .ok_or_else(|| CryptoError::CorruptState("missing receiving chain".to_string()))?;
        let (next_chain, mut message_key) = kdf_chain(&chain);
        self.receiving_chain = Some(next_chain);
        self.msg_recv = self.msg_recv.saturating_add(1);

        let result = open(&message_key, ciphertext, &aad);
        message_key.zeroize();
        result
    }

    fn dh_ratchet_send<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<[u8; 32], CryptoError> {
        let remote = self
            .dh_remote
            .ok_or_else(|| CryptoError::CorruptState("missing remote ratchet key".to_string()))?;

        let dh_self = StaticSecret::random_from_rng(&mut *rng);
        let dh_out = dh_self.diffie_hellman(&PublicKey::from(remote)).to_bytes();
        let (root_key, chain) = kdf_root(&self.root_key, &dh_out);

        self.dh_self.zeroize();
        self.dh_self = dh_self.to_bytes();
        self.root_key = root_key;
        self.prev_chain_len = self.msg_send;
        self.msg_send = 0;
        Ok(chain)
    }

    fn dh_ratchet_receive(&mut self, remote_pub: [u8; 32]) {
        let dh_self = StaticSecret::from(self.dh_self);
        let dh_out = dh_self.diffie_hellman(&PublicKey::from(remote_pub)).to_bytes();
        let (root_key, chain) = kdf_root(&self.root_key, &dh_out);

        self.root_key = root_key;
        self.receiving_chain = Some(chain);
        self.sending_chain = None;
        self.dh_remote = Some(remote_pub);
        self.msg_recv = 0;
    }

    fn skip_message_keys(&mut self, until: u32) -> Result<(), CryptoError> {
        if until > self.msg_recv.saturating_add(MAX_SKIP) {
            return Err(CryptoError::InvalidMessage(format!(
                "too many skipped messages ({} -> {until})",
                self.msg_recv
            )));
        }

        let Some(remote) = self.dh_remote else {
            return Ok(());
        };

        while self.msg_recv < until {
            let chain = self
                .receiving_chain
                .ok_or_else(|| CryptoError::CorruptState("missing receiving chain".to_string()))?;
            let (next_chain, key) = kdf_chain(&chain);
            self.receiving_chain = Some(next_chain);
            self.skipped.push(SkippedKey { dh_pub: remote, msg_num: self.msg_recv, key });
            self.msg_recv += 1;
        }

        if self.skipped.len() > MAX_STORED_SKIPPED {
            let excess = self.skipped.len() - MAX_STORED_SKIPPED;
            for mut evicted in self.skipped.drain(..excess) {
                evicted.key.zeroize();
            }
        }

        Ok(())
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_self.zeroize();
        if let Some(chain) = self.sending_chain.as_mut() {
            chain.zeroize();
        }
        if let Some(chain) = self.receiving_chain.as_mut() {
            chain.zeroize();
        }
        for skipped in &mut self.skipped {
            skipped.key.zeroize();
        }
    }
}

fn aad(associated_data: &[u8], header: &Header) -> Vec<u8> {
    let mut aad = Vec::with_capacity(associated_data.len() + 40);
    aad.extend_from_slice(associated_data);
    aad.extend_from_slice(&header.serialized());
    aad
}
