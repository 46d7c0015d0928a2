//! Key rotation scheduler.
//!
//! Keeps the one-time prekey pool at its floor and the signed prekey fresh.
//! Both operations are no-ops when nothing is due, so they can run after
//! every receive cycle.
//!
//! # Write ordering
//!
//! The store has no cross-key transactions, so each step is ordered to make a
//! retry safe:
//!
//! - `prekeyMaxId` is advanced before any prekey is stored. A crash after that
//!   point wastes ids but never reuses one the directory may already hold.
//! - New keys are marked pending and stored before upload. A failed upload
//!   leaves them in place, because a lost response can hide an upload the
//!   directory applied. The next pass re-uploads the same records, so an id
//!   the directory advertises always opens with the key this device holds.
//! - The signed prekey before the current one is kept so prekey messages
//!   built from the old bundle still decrypt. Anything older is deleted once
//!   the current one is confirmed uploaded.

use std::time::Duration;

use pinpoint_crypto::{PreKeyRecord, SessionEngine, SignedPreKeyRecord};
use pinpoint_proto::{ErrorKind, RemoteError};
use thiserror::Error;

use crate::{
    directory::Directory,
    env::{EnvRng, Environment},
    storage::{KeyValueStore, StorageError},
    store::SecureStore,
};

/// Rotation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Minimum number of unconsumed one-time prekeys.
    pub prekey_floor: u32,
    /// Maximum age of the current signed prekey.
    pub signed_prekey_max_age: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self { prekey_floor: 50, signed_prekey_max_age: Duration::from_secs(5 * 24 * 60 * 60) }
    }
}

/// Rotation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    /// No local device exists.
    #[error("no local device")]
    NoLocalDevice,

    /// Directory rejected or failed the upload.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RotationError {
    /// Classify into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoLocalDevice => ErrorKind::NoLocalDevice,
            Self::Remote(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}

/// Transient view that tops up and rotates local key material.
pub struct KeyRotationScheduler<'a, K: KeyValueStore, G: SessionEngine, E: Environment> {
    store: &'a SecureStore<K>,
    engine: &'a G,
    env: &'a E,
    directory: &'a dyn Directory,
    policy: RotationPolicy,
}

impl<'a, K: KeyValueStore, G: SessionEngine, E: Environment> KeyRotationScheduler<'a, K, G, E> {
    /// Borrow the collaborators for one maintenance pass.
    pub fn new(
        store: &'a SecureStore<K>,
        engine: &'a G,
        env: &'a E,
        directory: &'a dyn Directory,
        policy: RotationPolicy,
    ) -> Self {
        Self { store, engine, env, directory, policy }
    }

    /// Top the one-time prekey pool back up to the floor.
    ///
    /// Prekeys left pending by an earlier failed upload are uploaded first.
    /// Returns the number of prekeys uploaded.
    pub async fn replenish_prekeys(&self) -> Result<u32, RotationError> {
        self.require_device()?;
        let retried = self.retry_pending_prekeys().await?;

        let held = self.store.prekey_ids()?;
        let held_count = held.len() as u32;
        if held_count >= self.policy.prekey_floor {
            return Ok(retried);
        }

        let max_id = self
            .store
            .prekey_max_id()?
            .unwrap_or(0)
            .max(held.last().copied().unwrap_or(0));
        let count = self.policy.prekey_floor - held_count;
        let start_id = max_id + 1;

        let mut rng = EnvRng::new(self.env);
        let records = self.engine.generate_prekeys(start_id, count, &mut rng);
        let ids: Vec<u32> = records.iter().map(|record| record.id).collect();

        self.store.set_prekey_max_id(max_id + count)?;
        self.store.set_pending_prekey_upload(&ids)?;
        for record in &records {
            self.store.store_prekey(record)?;
        }
        self.upload_prekeys(&records).await?;

        tracing::info!(count, first_id = start_id, held = held_count, "prekeys replenished");
        Ok(retried + count)
    }

    async fn retry_pending_prekeys(&self) -> Result<u32, RotationError> {
        let pending = self.store.pending_prekey_upload()?;
        if pending.is_empty() {
            return Ok(0);
        }

        // Consumed ones were handed out, so the directory had them.
        let mut records = Vec::with_capacity(pending.len());
        for id in pending {
            if let Some(record) = self.store.prekey(id)? {
                records.push(record);
            }
        }
        if records.is_empty() {
            self.store.clear_pending_prekey_upload()?;
            return Ok(0);
        }

        tracing::info!(count = records.len(), first_id = records[0].id, "retrying prekey upload");
        self.upload_prekeys(&records).await?;
        Ok(records.len() as u32)
    }

    async fn upload_prekeys(&self, records: &[PreKeyRecord]) -> Result<(), RotationError> {
        let public = records.iter().map(PreKeyRecord::public).collect();
        match self.directory.upload_prekeys(self.store.local_address(), public).await {
            Ok(()) => {},
            // Ids are never reassigned, so the directory holds these from an
            // attempt whose response was lost.
            Err(RemoteError::PreKeyIdCollision) => {
                tracing::info!(count = records.len(), "prekeys already uploaded");
            },
            Err(e) => {
                tracing::warn!(error = %e, count = records.len(), "prekey upload failed, keys kept for retry");
                return Err(e.into());
            },
        }
        self.store.clear_pending_prekey_upload()?;
        Ok(())
    }

    /// Replace the signed prekey if it is older than the policy allows, or
    /// create one if none exists.
    ///
    /// A signed prekey left pending by an earlier failed upload is uploaded
    /// again with the same id and key before anything else. Returns `true`
    /// if a signed prekey was uploaded.
    pub async fn rotate_signed_prekey_if_stale(&self) -> Result<bool, RotationError> {
        let identity = self.store.identity()?.ok_or(RotationError::NoLocalDevice)?;

        if let Some(id) = self.store.pending_signed_prekey_upload()? {
            match self.store.signed_prekey(id)? {
                Some(record) => {
                    tracing::info!(id, "retrying signed prekey upload");
                    self.upload_signed_prekey(&record).await?;
                    return Ok(true);
                },
                None => self.store.clear_pending_signed_prekey_upload()?,
            }
        }

        let now_ms = self.env.wall_clock_ms();
        let max_age_ms = self.policy.signed_prekey_max_age.as_millis() as u64;

        let ids = self.store.signed_prekey_ids()?;
        let current = match ids.last() {
            Some(id) => self.store.signed_prekey(*id)?,
            None => None,
        };
        if let Some(current) = &current {
            if current.age_ms(now_ms) <= max_age_ms {
                return Ok(false);
            }
        }

        let new_id = ids.last().map_or(1, |id| id + 1);
        let mut rng = EnvRng::new(self.env);
        let record = self.engine.generate_signed_prekey(&identity, new_id, now_ms, &mut rng);
        self.store.set_pending_signed_prekey_upload(new_id)?;
        self.store.store_signed_prekey(&record)?;
        self.upload_signed_prekey(&record).await?;

        tracing::info!(
            id = new_id,
            previous = ?ids.last(),
            age_ms = current.as_ref().map(|c| c.age_ms(now_ms)),
            "signed prekey rotated"
        );
        Ok(true)
    }

    async fn upload_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), RotationError> {
        if let Err(e) =
            self.directory.upload_signed_prekey(self.store.local_address(), record.public()).await
        {
            tracing::warn!(error = %e, id = record.id, "signed prekey upload failed, key kept for retry");
            return Err(e.into());
        }
        self.store.clear_pending_signed_prekey_upload()?;

        // Keep the uploaded one and the one it replaced.
        let ids = self.store.signed_prekey_ids()?;
        for id in &ids[..ids.len().saturating_sub(2)] {
            self.store.remove_signed_prekey(*id)?;
        }
        Ok(())
    }

    fn require_device(&self) -> Result<(), RotationError> {
        if self.store.has_local_device()? { Ok(()) } else { Err(RotationError::NoLocalDevice) }
    }
}
