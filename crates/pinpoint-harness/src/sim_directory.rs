//! In-memory directory and relay for simulation.
//!
//! `SimDirectory` implements [`Directory`] with the same rejection rules a
//! real server applies (registration checks, prekey pool limits, per-id
//! delete outcomes), plus hooks for fault injection and inspection.
//! Clones share one state, so every simulated device talks to the same
//! relay.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use pinpoint_core::Directory;
use pinpoint_proto::{
    DeleteOutcome, DeviceRegistration, IdentityKey, OutboundMessage, PeerAddress, PreKeyBundle,
    PublicPreKey, PublicSignedPreKey, RegistrationId, RelayMessage, RemoteError,
};

/// Maximum one-time prekeys held per device.
pub const PREKEY_POOL_LIMIT: usize = 100;

/// Directory request kinds, for fault injection and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    /// [`Directory::create_device`]
    CreateDevice,
    /// [`Directory::fetch_prekey_bundle`]
    FetchPreKeyBundle,
    /// [`Directory::send_message`]
    SendMessage,
    /// [`Directory::fetch_messages`]
    FetchMessages,
    /// [`Directory::delete_messages`]
    DeleteMessages,
    /// [`Directory::upload_prekeys`]
    UploadPreKeys,
    /// [`Directory::upload_signed_prekey`]
    UploadSignedPreKey,
    /// [`Directory::delete_device`]
    DeleteDevice,
}

enum Fault {
    Fail(RemoteError),
    Stall,
}

struct DeviceRecord {
    registration_id: RegistrationId,
    identity_key: IdentityKey,
    signed_prekey: PublicSignedPreKey,
    prekeys: VecDeque<PublicPreKey>,
}

struct Queued {
    recipient: PeerAddress,
    message: RelayMessage,
}

#[derive(Default)]
struct State {
    users: BTreeSet<String>,
    devices: BTreeMap<PeerAddress, DeviceRecord>,
    messages: BTreeMap<u64, Queued>,
    next_message_id: u64,
    faults: HashMap<Request, VecDeque<Fault>>,
    lost_responses: HashMap<Request, VecDeque<RemoteError>>,
    delete_overrides: HashMap<u64, DeleteOutcome>,
    delete_requests: Vec<Vec<u64>>,
    request_counts: HashMap<Request, usize>,
}

impl State {
    fn missing(&self, target: &PeerAddress) -> RemoteError {
        if self.users.contains(&target.name) {
            RemoteError::RecipientHasNoDevice
        } else {
            RemoteError::RecipientNotFound
        }
    }

    fn own_device(
        &mut self,
        address: &PeerAddress,
        registration_id: Option<RegistrationId>,
    ) -> Result<&mut DeviceRecord, RemoteError> {
        match self.devices.get_mut(address) {
            Some(device) if registration_id.is_none_or(|id| id == device.registration_id) => {
                Ok(device)
            },
            _ => Err(RemoteError::LocalDeviceChanged),
        }
    }
}

/// Shared in-memory relay.
#[derive(Clone, Default)]
pub struct SimDirectory {
    state: Arc<Mutex<State>>,
}

impl SimDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("SimDirectory mutex poisoned")
    }

    /// Count the request and apply any queued fault.
    async fn begin(&self, request: Request) -> Result<(), RemoteError> {
        let fault = {
            let mut state = self.lock();
            *state.request_counts.entry(request).or_default() += 1;
            state.faults.get_mut(&request).and_then(VecDeque::pop_front)
        };

        match fault {
            None => Ok(()),
            Some(Fault::Fail(error)) => {
                tracing::debug!(?request, %error, "injected failure");
                Err(error)
            },
            Some(Fault::Stall) => {
                tracing::debug!(?request, "injected stall");
                std::future::pending::<()>().await;
                Ok(())
            },
        }
    }

    /// Report any queued lost response for a request that was applied.
    fn finish(&self, request: Request) -> Result<(), RemoteError> {
        match self.lock().lost_responses.get_mut(&request).and_then(VecDeque::pop_front) {
            None => Ok(()),
            Some(error) => {
                tracing::debug!(?request, %error, "injected lost response");
                Err(error)
            },
        }
    }

    // Fault injection

    /// Fail the next `request` with `error`. Queued faults apply in order.
    pub fn fail_next(&self, request: Request, error: RemoteError) {
        self.lock().faults.entry(request).or_default().push_back(Fault::Fail(error));
    }

    /// Apply the next `request`, then answer it with `error` as if the
    /// response was lost. Only uploads honour this.
    pub fn fail_after_next(&self, request: Request, error: RemoteError) {
        self.lock().lost_responses.entry(request).or_default().push_back(error);
    }

    /// Never answer the next `request`.
    pub fn stall_next(&self, request: Request) {
        self.lock().faults.entry(request).or_default().push_back(Fault::Stall);
    }

    /// Answer every delete of `id` with `outcome`, leaving the message
    /// queued.
    pub fn force_delete_outcome(&self, id: u64, outcome: DeleteOutcome) {
        self.lock().delete_overrides.insert(id, outcome);
    }

    /// Stop forcing an outcome for `id`.
    pub fn clear_delete_outcome(&self, id: u64) {
        self.lock().delete_overrides.remove(&id);
    }

    /// Queue raw bytes for `recipient` as if `sender` had sent them.
    pub fn inject_message(
        &self,
        recipient: &PeerAddress,
        sender: &PeerAddress,
        sender_registration_id: RegistrationId,
        ciphertext: Vec<u8>,
    ) -> u64 {
        let mut state = self.lock();
        state.next_message_id += 1;
        let id = state.next_message_id;
        state.messages.insert(id, Queued {
            recipient: recipient.clone(),
            message: RelayMessage {
                id,
                ciphertext,
                sender_registration_id,
                sender: sender.clone(),
            },
        });
        id
    }

    /// Drop a queued message without any client involvement.
    pub fn drop_message(&self, id: u64) -> bool {
        self.lock().messages.remove(&id).is_some()
    }

    /// Remove a device record as if another install had replaced it.
    pub fn evict_device(&self, address: &PeerAddress) -> bool {
        self.lock().devices.remove(address).is_some()
    }

    // Inspection

    /// True if `address` has a registered device.
    pub fn has_device(&self, address: &PeerAddress) -> bool {
        self.lock().devices.contains_key(address)
    }

    /// Registration id the directory holds for `address`.
    pub fn registration_id(&self, address: &PeerAddress) -> Option<RegistrationId> {
        self.lock().devices.get(address).map(|device| device.registration_id)
    }

    /// Identity the directory holds for `address`.
    pub fn identity_key(&self, address: &PeerAddress) -> Option<IdentityKey> {
        self.lock().devices.get(address).map(|device| device.identity_key)
    }

    /// One-time prekeys left in the pool of `address`.
    pub fn prekey_count(&self, address: &PeerAddress) -> usize {
        self.lock().devices.get(address).map_or(0, |device| device.prekeys.len())
    }

    /// Id of the signed prekey published by `address`.
    pub fn signed_prekey_id(&self, address: &PeerAddress) -> Option<u32> {
        self.lock().devices.get(address).map(|device| device.signed_prekey.id)
    }

    /// Messages queued for `address`, oldest first.
    pub fn pending_messages(&self, address: &PeerAddress) -> Vec<RelayMessage> {
        self.lock()
            .messages
            .values()
            .filter(|queued| queued.recipient == *address)
            .map(|queued| queued.message.clone())
            .collect()
    }

    /// Every id list passed to `delete_messages`, in call order.
    pub fn delete_requests(&self) -> Vec<Vec<u64>> {
        self.lock().delete_requests.clone()
    }

    /// Number of `request` calls so far, failed ones included.
    pub fn request_count(&self, request: Request) -> usize {
        self.lock().request_counts.get(&request).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Directory for SimDirectory {
    async fn create_device(&self, registration: DeviceRegistration) -> Result<(), RemoteError> {
        self.begin(Request::CreateDevice).await?;
        let mut state = self.lock();

        if state.devices.contains_key(&registration.address) {
            return Err(RemoteError::DeviceAlreadyExists);
        }
        if registration.prekeys.len() > PREKEY_POOL_LIMIT {
            return Err(RemoteError::PreKeyPoolExhausted);
        }

        tracing::debug!(address = %registration.address, "device registered");
        state.users.insert(registration.address.name.clone());
        state.devices.insert(registration.address, DeviceRecord {
            registration_id: registration.registration_id,
            identity_key: registration.identity_key,
            signed_prekey: registration.signed_prekey,
            prekeys: registration.prekeys.into(),
        });
        Ok(())
    }

    async fn fetch_prekey_bundle(
        &self,
        target: &PeerAddress,
        _requester_registration_id: RegistrationId,
    ) -> Result<PreKeyBundle, RemoteError> {
        self.begin(Request::FetchPreKeyBundle).await?;
        let mut state = self.lock();

        let missing = state.missing(target);
        let device = state.devices.get_mut(target).ok_or(missing)?;
        Ok(PreKeyBundle {
            address: target.clone(),
            registration_id: device.registration_id,
            identity_key: device.identity_key,
            prekey: device.prekeys.pop_front(),
            signed_prekey: device.signed_prekey.clone(),
        })
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<(), RemoteError> {
        self.begin(Request::SendMessage).await?;
        let mut state = self.lock();

        state.own_device(&message.sender, Some(message.sender_registration_id))?;
        let recipient_registration_id = match state.devices.get(&message.recipient) {
            Some(device) => device.registration_id,
            None => return Err(state.missing(&message.recipient)),
        };
        if recipient_registration_id != message.recipient_registration_id {
            return Err(RemoteError::StaleRecipientDevice);
        }

        state.next_message_id += 1;
        let id = state.next_message_id;
        tracing::debug!(id, from = %message.sender, to = %message.recipient, "message queued");
        state.messages.insert(id, Queued {
            recipient: message.recipient,
            message: RelayMessage {
                id,
                ciphertext: message.ciphertext,
                sender_registration_id: message.sender_registration_id,
                sender: message.sender,
            },
        });
        Ok(())
    }

    async fn fetch_messages(
        &self,
        address: &PeerAddress,
        registration_id: RegistrationId,
    ) -> Result<Vec<RelayMessage>, RemoteError> {
        self.begin(Request::FetchMessages).await?;
        let mut state = self.lock();

        state.own_device(address, Some(registration_id))?;
        Ok(state
            .messages
            .values()
            .filter(|queued| queued.recipient == *address)
            .map(|queued| queued.message.clone())
            .collect())
    }

    async fn delete_messages(
        &self,
        address: &PeerAddress,
        ids: &[u64],
    ) -> Result<Vec<DeleteOutcome>, RemoteError> {
        self.begin(Request::DeleteMessages).await?;
        let mut state = self.lock();
        state.delete_requests.push(ids.to_vec());

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = match state.delete_overrides.get(id) {
                Some(forced) => *forced,
                None => match state.messages.get(id).map(|queued| queued.recipient == *address) {
                    None => DeleteOutcome::Nonexistent,
                    Some(false) => DeleteOutcome::NotOwner,
                    Some(true) => {
                        state.messages.remove(id);
                        DeleteOutcome::Deleted
                    },
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn upload_prekeys(
        &self,
        address: &PeerAddress,
        prekeys: Vec<PublicPreKey>,
    ) -> Result<(), RemoteError> {
        self.begin(Request::UploadPreKeys).await?;
        {
            let mut state = self.lock();
            let device = state.own_device(address, None)?;

            if prekeys.iter().any(|new| device.prekeys.iter().any(|held| held.id == new.id)) {
                return Err(RemoteError::PreKeyIdCollision);
            }
            if device.prekeys.len() + prekeys.len() > PREKEY_POOL_LIMIT {
                return Err(RemoteError::PreKeyPoolExhausted);
            }

            device.prekeys.extend(prekeys);
        }
        self.finish(Request::UploadPreKeys)
    }

    async fn upload_signed_prekey(
        &self,
        address: &PeerAddress,
        signed_prekey: PublicSignedPreKey,
    ) -> Result<(), RemoteError> {
        self.begin(Request::UploadSignedPreKey).await?;
        self.lock().own_device(address, None)?.signed_prekey = signed_prekey;
        self.finish(Request::UploadSignedPreKey)
    }

    async fn delete_device(&self, address: &PeerAddress) -> Result<(), RemoteError> {
        self.begin(Request::DeleteDevice).await?;
        let mut state = self.lock();

        if state.devices.remove(address).is_none() {
            return Err(RemoteError::LocalDeviceChanged);
        }
        state.messages.retain(|_, queued| queued.recipient != *address);
        tracing::debug!(address = %address, "device removed");
        Ok(())
    }
}
