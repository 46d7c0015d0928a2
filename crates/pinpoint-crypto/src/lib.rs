//! Pinpoint Session Engine
//!
//! Pairwise end-to-end encryption between devices: an X3DH-style prekey
//! handshake bootstraps a double ratchet that then carries every message.
//!
//! # Key Lifecycle
//!
//! ```text
//! Identity + Signed PreKey + One-Time PreKey (published)
//!        │
//!        ▼
//! X3DH → Root Secret (per session)
//!        │
//!        ▼
//! DH Ratchet → Chain Keys (per change of speaker)
//!        │
//!        ▼
//! Symmetric Ratchet → Message Keys → AEAD
//! ```
//!
//! # Storage
//!
//! The engine owns no state. Every call reads and writes through a
//! [`ProtocolStore`], so sessions survive restarts and the caller decides
//! where key material lives. Decryption works on a copy of the ratchet and
//! persists only on success; a rejected message never advances a session.
//!
//! # Identity
//!
//! Each store call site checks the peer's identity against the trusted record.
//! A mismatch fails with [`CryptoError::UntrustedIdentity`] carrying the
//! observed key and never overwrites the record.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod aead;
mod engine;
mod error;
mod kdf;
mod keys;
mod message;
mod ratchet;
mod session;
mod x3dh;

pub use engine::{DoubleRatchetEngine, ProtocolStore, SessionEngine};
pub use error::CryptoError;
pub use keys::{
    IdentityKeyPair, PreKeyRecord, SignedPreKeyRecord, generate_prekeys, generate_registration_id,
    verify_signed_prekey,
};
pub use message::{CiphertextMessage, PreKeyMessage, StandardMessage};
pub use ratchet::{Header, RatchetState};
pub use session::SessionRecord;
