//! Messaging orchestrator.
//!
//! One [`Messenger`] per local device. It composes the core components for
//! each operation, runs directory requests strictly one after another, and
//! turns failures into [`MessengerError`]s and [`MessengerEvent`]s.
//!
//! # Concurrency
//!
//! Operations on the same peer are serialized by a per-peer lock so that
//! ratchet state is never read and written by two operations at once.
//! Device-wide operations (create, delete, reset, receive cycle) are
//! serialized by a separate device lock. The receive cycle takes the device
//! lock first and each sender's lock second; nothing takes them in the
//! opposite order.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use pinpoint_core::{
    BroadcastRegistry, DeleteLedger, Directory, EnvRng, Environment, InboxSummary,
    KeyRotationScheduler, KeyValueStore, LiveBroadcast, MessageInbox, MessagePayload,
    SecureStore, SessionError, SessionManager, StoredMessage,
};
use pinpoint_crypto::{CryptoError, PreKeyRecord, SessionEngine};
use pinpoint_proto::{
    DeleteOutcome, DeviceRegistration, ErrorKind, IdentityKey, Location, MessageBody,
    OutboundMessage, PeerAddress, RegistrationId, RelayMessage, RemoteError,
};
use tokio::sync::{OwnedMutexGuard, broadcast};

use crate::{MessengerConfig, MessengerError, MessengerEvent, TimedDirectory};

/// Shortest pause between live broadcast rounds.
const MIN_LIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Result of one receive-and-reconcile cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    /// Messages fetched from the relay.
    pub fetched: usize,
    /// Locations decrypted and stored.
    pub stored: usize,
    /// Messages stored as error markers.
    pub failed: usize,
    /// Redelivered messages that were already processed.
    pub duplicates: usize,
    /// Senders whose identity changed. Their messages stay on the relay.
    pub identity_changes: Vec<PeerAddress>,
    /// Fetched ids skipped because their deletion is known to fail.
    pub skipped: usize,
    /// Ids deleted from the relay.
    pub deleted: usize,
    /// Ids whose deletion failed for good and were recorded.
    pub delete_rejected: usize,
    /// Ids whose deletion failed transiently. Retried next cycle.
    pub delete_deferred: usize,
    /// Key maintenance failure, if any.
    pub maintenance_error: Option<ErrorKind>,
}

/// Result of [`Messenger::broadcast_location`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients the location was delivered to.
    pub delivered: Vec<PeerAddress>,
    /// Recipients that failed, with the failure kind.
    pub failed: Vec<(PeerAddress, ErrorKind)>,
}

/// What happened to one fetched message.
enum Processed {
    Stored,
    Failed,
    Duplicate,
    IdentityChanged,
}

impl Processed {
    fn deletable(&self) -> bool {
        !matches!(self, Self::IdentityChanged)
    }
}

/// Per-peer async locks. Entries nobody holds are dropped on the next
/// acquire.
#[derive(Default)]
struct PeerLocks {
    locks: Mutex<HashMap<PeerAddress, Arc<tokio::sync::Mutex<()>>>>,
}

impl PeerLocks {
    async fn acquire(&self, peer: &PeerAddress) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(peer.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Location messenger for one local device.
pub struct Messenger<K: KeyValueStore, G: SessionEngine, E: Environment> {
    store: SecureStore<K>,
    engine: G,
    env: E,
    directory: TimedDirectory,
    config: MessengerConfig,
    events: broadcast::Sender<MessengerEvent>,
    peer_locks: PeerLocks,
    device_lock: tokio::sync::Mutex<()>,
}

impl<K: KeyValueStore, G: SessionEngine, E: Environment> Messenger<K, G, E> {
    /// Messenger for `local`, persisting into `kv` and talking to
    /// `directory`.
    pub fn new(
        local: PeerAddress,
        kv: K,
        engine: G,
        env: E,
        directory: Arc<dyn Directory>,
        config: MessengerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            store: SecureStore::new(kv, local),
            engine,
            env,
            directory: TimedDirectory::new(directory, config.request_timeout),
            config,
            events,
            peer_locks: PeerLocks::default(),
            device_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Address of the local device.
    pub fn local_address(&self) -> &PeerAddress {
        self.store.local_address()
    }

    /// Secure store of the local device.
    pub fn store(&self) -> &SecureStore<K> {
        &self.store
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        self.events.subscribe()
    }

    /// True once [`Self::create_device`] has succeeded.
    pub fn has_local_device(&self) -> Result<bool, MessengerError> {
        Ok(self.store.has_local_device()?)
    }

    // Device lifecycle

    /// Generate keys, register them with the directory, then persist them.
    ///
    /// Nothing is written locally unless registration succeeds. Returns the
    /// new public identity.
    pub async fn create_device(&self) -> Result<IdentityKey, MessengerError> {
        let _device = self.device_lock.lock().await;
        self.create_device_locked().await.map_err(|e| self.surface(e))
    }

    async fn create_device_locked(&self) -> Result<IdentityKey, MessengerError> {
        let local = self.local_address().clone();
        if self.store.has_local_device()? {
            return Err(MessengerError::DeviceExists(local));
        }

        let (identity, registration_id, prekeys, signed) = {
            let mut rng = EnvRng::new(&self.env);
            let identity = self.engine.generate_identity(&mut rng);
            let registration_id = self.engine.generate_registration_id(&mut rng);
            let prekeys = self.engine.generate_prekeys(1, self.config.rotation.prekey_floor, &mut rng);
            let signed =
                self.engine.generate_signed_prekey(&identity, 1, self.env.wall_clock_ms(), &mut rng);
            (identity, registration_id, prekeys, signed)
        };

        self.directory
            .create_device(DeviceRegistration {
                address: local.clone(),
                registration_id,
                identity_key: identity.public(),
                prekeys: prekeys.iter().map(PreKeyRecord::public).collect(),
                signed_prekey: signed.public(),
            })
            .await?;

        // Leftovers from an earlier attempt that failed half way.
        self.store.wipe()?;
        for prekey in &prekeys {
            self.store.store_prekey(prekey)?;
        }
        self.store.set_prekey_max_id(prekeys.len() as u32)?;
        self.store.store_signed_prekey(&signed)?;
        self.store.set_registration_id(registration_id)?;
        // Identity last: its presence marks the device as complete.
        self.store.set_identity(&identity)?;

        tracing::info!(
            address = %local,
            registration_id,
            fingerprint = %identity.public().fingerprint(),
            prekeys = prekeys.len(),
            "device created"
        );
        Ok(identity.public())
    }

    /// Remove the device from the directory, then wipe local state.
    pub async fn delete_device(&self) -> Result<(), MessengerError> {
        let _device = self.device_lock.lock().await;
        self.delete_device_locked().await.map_err(|e| self.surface(e))
    }

    async fn delete_device_locked(&self) -> Result<(), MessengerError> {
        self.local_registration_id()?;
        self.directory.delete_device(self.local_address()).await?;
        let removed = self.store.wipe()?;
        tracing::info!(address = %self.local_address(), removed, "device deleted");
        Ok(())
    }

    /// Wipe local state without contacting the directory.
    ///
    /// The response to [`MessengerEvent::RemoteDeviceChanged`]. Returns the
    /// number of entries removed.
    pub async fn reset_local_state(&self) -> Result<usize, MessengerError> {
        let _device = self.device_lock.lock().await;
        let removed = self.store.wipe()?;
        tracing::warn!(address = %self.local_address(), removed, "local state reset");
        Ok(removed)
    }

    // Sending

    /// Encrypt and send `location` to `recipient`.
    ///
    /// If the relay reports that the recipient re-registered, the stale
    /// session is dropped and the send is retried once through a fresh
    /// bundle. A changed identity then fails with
    /// [`ErrorKind::AlteredIdentity`] and nothing is sent.
    pub async fn send_location(
        &self,
        recipient: &PeerAddress,
        location: &Location,
    ) -> Result<(), MessengerError> {
        let result = match encode_location(location) {
            Ok(body) => {
                let _peer = self.peer_locks.acquire(recipient).await;
                self.deliver(recipient, &body).await
            },
            Err(e) => Err(e),
        };
        result.map_err(|e| self.surface(e))
    }

    async fn deliver(&self, recipient: &PeerAddress, body: &[u8]) -> Result<(), MessengerError> {
        let sessions = self.sessions();

        match self.submit(recipient, &sessions, body).await {
            Err(MessengerError::Remote(RemoteError::StaleRecipientDevice)) => {
                tracing::info!(peer = %recipient, "recipient device changed, re-establishing");
                sessions.reset_session(recipient)?;
                self.submit(recipient, &sessions, body).await
            },
            result => result,
        }
    }

    async fn submit(
        &self,
        recipient: &PeerAddress,
        sessions: &SessionManager<'_, K, G, E>,
        body: &[u8],
    ) -> Result<(), MessengerError> {
        let sealed = sessions.send(recipient, body).await?;
        let sender_registration_id = self.local_registration_id()?;

        self.directory
            .send_message(OutboundMessage {
                recipient: recipient.clone(),
                recipient_registration_id: sealed.recipient_registration_id,
                sender: self.local_address().clone(),
                sender_registration_id,
                ciphertext: sealed.bytes,
            })
            .await?;

        tracing::debug!(peer = %recipient, prekey = sealed.is_prekey, "message sent");
        Ok(())
    }

    // Receiving

    /// Fetch pending messages, decrypt and store them, delete what was
    /// handled, then run key maintenance.
    ///
    /// Per-message failures are stored as error markers rather than failing
    /// the cycle. Messages from senders whose identity changed are left on
    /// the relay until the change is accepted. Maintenance failures are
    /// reported in the result and as events, never as an error.
    pub async fn receive_and_reconcile(&self) -> Result<ReceiveReport, MessengerError> {
        let _device = self.device_lock.lock().await;
        self.receive_locked().await.map_err(|e| self.surface(e))
    }

    async fn receive_locked(&self) -> Result<ReceiveReport, MessengerError> {
        let registration_id = self.local_registration_id()?;
        let local = self.local_address();
        let batch = self.directory.fetch_messages(local, registration_id).await?;

        let mut report = ReceiveReport { fetched: batch.len(), ..ReceiveReport::default() };
        let ledger = DeleteLedger::new(&self.store);
        let pending_ids: Vec<u64> = batch.iter().map(|message| message.id).collect();
        let pruned = ledger.retain_only(&pending_ids)?;
        if pruned > 0 {
            tracing::debug!(pruned, "ledger pruned to relay backlog");
        }

        // Known-bad ids were handled in an earlier cycle.
        let fresh = ledger.filter_new(&pending_ids)?;
        report.skipped = pending_ids.len() - fresh.len();

        let mut marked = Vec::new();
        for message in batch.iter().filter(|message| fresh.contains(&message.id)) {
            let processed = self.process(message).await?;
            match processed {
                Processed::Stored => report.stored += 1,
                Processed::Failed => report.failed += 1,
                Processed::Duplicate => report.duplicates += 1,
                Processed::IdentityChanged => {
                    if !report.identity_changes.contains(&message.sender) {
                        report.identity_changes.push(message.sender.clone());
                    }
                },
            }
            if processed.deletable() {
                marked.push(message.id);
            }
        }

        let to_delete = ledger.filter_new(&marked)?;
        if !to_delete.is_empty() {
            let outcomes = self.directory.delete_messages(local, &to_delete).await?;
            if outcomes.len() != to_delete.len() {
                return Err(RemoteError::Malformed(format!(
                    "{} delete outcomes for {} ids",
                    outcomes.len(),
                    to_delete.len()
                ))
                .into());
            }

            let mut rejected = Vec::new();
            for (id, outcome) in to_delete.iter().zip(outcomes) {
                match outcome {
                    DeleteOutcome::Deleted => report.deleted += 1,
                    outcome if outcome.is_deterministic_failure() => rejected.push(*id),
                    _ => report.delete_deferred += 1,
                }
            }

            report.delete_rejected = rejected.len();
            if !rejected.is_empty() {
                tracing::warn!(ids = ?rejected, "recording failed deletions");
                ledger.record_failures(&rejected)?;
            }
        }

        report.maintenance_error = self.maintain().await.err().map(|e| e.kind());

        tracing::info!(
            fetched = report.fetched,
            stored = report.stored,
            failed = report.failed,
            deleted = report.deleted,
            rejected = report.delete_rejected,
            deferred = report.delete_deferred,
            "batch reconciled"
        );
        Ok(report)
    }

    /// Decrypt one message and store the outcome. Only local storage
    /// failures abort; everything else is recorded for the sender.
    async fn process(&self, message: &RelayMessage) -> Result<Processed, MessengerError> {
        let sender = &message.sender;
        let _peer = self.peer_locks.acquire(sender).await;

        let payload = match self.sessions().receive(sender, &message.ciphertext) {
            Ok(plaintext) => match MessageBody::decode(&plaintext) {
                Ok(body) => MessagePayload::Location(body.location),
                Err(e) => {
                    tracing::warn!(peer = %sender, id = message.id, error = %e, "undecodable message body");
                    MessagePayload::Error(e.kind())
                },
            },
            Err(SessionError::Crypto(CryptoError::DuplicateMessage)) => {
                tracing::debug!(peer = %sender, id = message.id, "duplicate message");
                return Ok(Processed::Duplicate);
            },
            Err(SessionError::AlteredIdentity { peer, observed }) => {
                BroadcastRegistry::new(&self.store)
                    .record_outcome(&peer, Some(ErrorKind::AlteredIdentity))?;
                self.store_message(message, MessagePayload::Error(ErrorKind::AlteredIdentity))?;
                self.emit(MessengerEvent::IdentityChanged {
                    peer,
                    fingerprint: observed.fingerprint(),
                });
                return Ok(Processed::IdentityChanged);
            },
            Err(e) if matches!(e.kind(), ErrorKind::Storage | ErrorKind::NoLocalDevice) => {
                return Err(e.into());
            },
            Err(e) => {
                tracing::warn!(peer = %sender, id = message.id, error = %e, "message rejected");
                MessagePayload::Error(e.kind())
            },
        };

        let location = matches!(payload, MessagePayload::Location(_));
        if !self.store_message(message, payload)? {
            tracing::debug!(peer = %sender, id = message.id, "redelivery, inbox entry kept");
            return Ok(Processed::Duplicate);
        }
        Ok(if location { Processed::Stored } else { Processed::Failed })
    }

    /// Returns `false` when the inbox already holds a later message from this
    /// sender, which is left in place.
    fn store_message(
        &self,
        message: &RelayMessage,
        payload: MessagePayload,
    ) -> Result<bool, MessengerError> {
        let kept = MessageInbox::new(&self.store).store_if_newer(&StoredMessage {
            id: message.id,
            sender: message.sender.clone(),
            received_at_ms: self.env.wall_clock_ms(),
            payload,
        })?;
        Ok(kept)
    }

    // Key maintenance

    /// Top up prekeys and rotate the signed prekey if due.
    ///
    /// Both steps run even if the first fails; the first failure is returned
    /// and published as [`MessengerEvent::MaintenanceFailed`].
    pub async fn run_maintenance(&self) -> Result<(), MessengerError> {
        let _device = self.device_lock.lock().await;
        self.maintain().await
    }

    async fn maintain(&self) -> Result<(), MessengerError> {
        let scheduler = KeyRotationScheduler::new(
            &self.store,
            &self.engine,
            &self.env,
            &self.directory,
            self.config.rotation,
        );

        let replenished = scheduler.replenish_prekeys().await;
        let rotated = scheduler.rotate_signed_prekey_if_stale().await;

        let Err(error) = replenished.and(rotated) else {
            return Ok(());
        };

        tracing::warn!(error = %error, "key maintenance failed");
        self.emit(MessengerEvent::MaintenanceFailed { kind: error.kind() });
        Err(self.surface(error.into()))
    }

    // Identity

    /// Trust the pending identity of `peer`.
    ///
    /// Clears the stale session and the error recorded on a live broadcast
    /// to `peer`. Returns `false` if no change was pending.
    pub async fn accept_new_identity(&self, peer: &PeerAddress) -> Result<bool, MessengerError> {
        let _peer = self.peer_locks.acquire(peer).await;
        if !self.sessions().accept_new_identity(peer)? {
            return Ok(false);
        }
        BroadcastRegistry::new(&self.store).record_outcome(peer, None)?;
        Ok(true)
    }

    /// Identity observed for `peer` and awaiting consent.
    pub fn pending_identity(&self, peer: &PeerAddress) -> Result<Option<IdentityKey>, MessengerError> {
        Ok(self.store.pending_identity(peer)?)
    }

    // Live sharing

    /// Share live location with `recipient` until `expiry_ms`. Replaces an
    /// existing share with the same recipient.
    pub fn start_live_sharing(
        &self,
        recipient: &PeerAddress,
        expiry_ms: u64,
    ) -> Result<(), MessengerError> {
        BroadcastRegistry::new(&self.store).add(recipient, expiry_ms)?;
        tracing::info!(peer = %recipient, expiry_ms, "live sharing started");
        Ok(())
    }

    /// Stop sharing with `recipient`. Returns `false` if no share existed.
    pub fn stop_live_sharing(&self, recipient: &PeerAddress) -> Result<bool, MessengerError> {
        let removed = BroadcastRegistry::new(&self.store).remove(recipient)?;
        if removed {
            tracing::info!(peer = %recipient, "live sharing stopped");
        }
        Ok(removed)
    }

    /// Unexpired live shares.
    pub fn live_broadcasts(&self) -> Result<Vec<LiveBroadcast>, MessengerError> {
        Ok(BroadcastRegistry::new(&self.store).list_active(self.env.wall_clock_ms())?)
    }

    /// Send `location` to every active live share and record each outcome.
    ///
    /// Per-recipient failures are reported, not returned. Failures that
    /// affect every recipient (no local device, unauthorized, own device
    /// changed, storage) abort the broadcast.
    pub async fn broadcast_location(
        &self,
        location: &Location,
    ) -> Result<BroadcastReport, MessengerError> {
        self.broadcast_inner(location).await.map_err(|e| self.surface(e))
    }

    async fn broadcast_inner(&self, location: &Location) -> Result<BroadcastReport, MessengerError> {
        location.validate().map_err(MessengerError::InvalidLocation)?;
        self.local_registration_id()?;

        let registry = BroadcastRegistry::new(&self.store);
        let mut report = BroadcastReport::default();

        for share in registry.list_active(self.env.wall_clock_ms())? {
            let recipient = share.recipient;
            let body = encode_location(&location.live_until(share.expiry_ms))?;

            let outcome = {
                let _peer = self.peer_locks.acquire(&recipient).await;
                self.deliver(&recipient, &body).await
            };

            match outcome {
                Ok(()) => {
                    registry.record_outcome(&recipient, None)?;
                    report.delivered.push(recipient);
                },
                Err(e) if aborts_broadcast(e.kind()) => return Err(e),
                Err(e) => {
                    let kind = e.kind();
                    tracing::warn!(peer = %recipient, error = %e, "live broadcast send failed");
                    registry.record_outcome(&recipient, Some(kind))?;
                    self.emit(MessengerEvent::BroadcastFailed { recipient: recipient.clone(), kind });
                    if let MessengerError::Session(SessionError::AlteredIdentity { peer, observed }) = &e {
                        self.emit(MessengerEvent::IdentityChanged {
                            peer: peer.clone(),
                            fingerprint: observed.fingerprint(),
                        });
                    }
                    report.failed.push((recipient, kind));
                },
            }
        }

        Ok(report)
    }

    /// Broadcast a fresh location every `interval` until no live share is
    /// active. `position` receives the current wall-clock time and returns
    /// the location for that round. Returns the number of rounds sent.
    ///
    /// Stops early with the error of a broadcast that aborts. Intervals
    /// shorter than one second are raised to one second.
    pub async fn run_live_sharing<F>(
        &self,
        interval: Duration,
        mut position: F,
    ) -> Result<usize, MessengerError>
    where
        F: FnMut(u64) -> Location + Send,
    {
        let interval = interval.max(MIN_LIVE_INTERVAL);
        let mut rounds = 0;

        while !self.live_broadcasts()?.is_empty() {
            let location = position(self.env.wall_clock_ms());
            let report = self.broadcast_location(&location).await?;
            tracing::debug!(
                round = rounds,
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "live round sent"
            );
            rounds += 1;
            self.env.sleep(interval).await;
        }

        tracing::info!(rounds, "live sharing finished");
        Ok(rounds)
    }

    // Inbox

    /// Latest message per sender, newest first.
    ///
    /// Corrupt entries are deleted and reported as a
    /// [`ErrorKind::Format`] error; calling again lists what remains.
    pub fn summaries(&self) -> Result<InboxSummary, MessengerError> {
        MessageInbox::new(&self.store).summarize().map_err(|e| {
            tracing::warn!(error = %e, "discarded corrupt inbox entries");
            e.into()
        })
    }

    /// Latest message from `sender`.
    pub fn message(&self, sender: &PeerAddress) -> Result<Option<StoredMessage>, MessengerError> {
        Ok(MessageInbox::new(&self.store).load(sender)?)
    }

    /// Remove the stored message from `sender`.
    pub fn remove_message(&self, sender: &PeerAddress) -> Result<(), MessengerError> {
        Ok(MessageInbox::new(&self.store).remove(sender)?)
    }

    // Internals

    fn sessions(&self) -> SessionManager<'_, K, G, E> {
        SessionManager::new(&self.store, &self.engine, &self.env, &self.directory)
    }

    fn local_registration_id(&self) -> Result<RegistrationId, MessengerError> {
        if !self.store.has_local_device()? {
            return Err(MessengerError::NoLocalDevice);
        }
        self.store.registration_id()?.ok_or(MessengerError::NoLocalDevice)
    }

    fn emit(&self, event: MessengerEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("no event subscribers");
        }
    }

    /// Publish events for failures the application must act on.
    fn surface(&self, error: MessengerError) -> MessengerError {
        match error.kind() {
            ErrorKind::Unauthorized => self.emit(MessengerEvent::Unauthorized),
            ErrorKind::RemoteDeviceChanged => self.emit(MessengerEvent::RemoteDeviceChanged),
            _ => {},
        }
        if let MessengerError::Session(SessionError::AlteredIdentity { peer, observed }) = &error {
            self.emit(MessengerEvent::IdentityChanged {
                peer: peer.clone(),
                fingerprint: observed.fingerprint(),
            });
        }
        error
    }
}

fn encode_location(location: &Location) -> Result<Vec<u8>, MessengerError> {
    location.validate().map_err(MessengerError::InvalidLocation)?;
    MessageBody::new(*location).encode().map_err(MessengerError::InvalidLocation)
}

fn aborts_broadcast(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::NoLocalDevice
            | ErrorKind::Unauthorized
            | ErrorKind::RemoteDeviceChanged
            | ErrorKind::Storage
    )
}
