//! Remote directory and relay contract.
//!
//! One request per call, no retries. Transport adapters map responses to
//! [`RemoteError`] via [`RemoteError::from_status`]; deadlines are applied by
//! the caller.

use async_trait::async_trait;
use pinpoint_proto::{
    DeleteOutcome, DeviceRegistration, OutboundMessage, PeerAddress, PreKeyBundle, PublicPreKey,
    PublicSignedPreKey, RegistrationId, RelayMessage, RemoteError,
};

/// Device directory, prekey server and message relay.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Register a new device. Conflicts yield
    /// [`RemoteError::DeviceAlreadyExists`].
    async fn create_device(&self, registration: DeviceRegistration) -> Result<(), RemoteError>;

    /// Fetch a bundle for `target`, consuming one of its one-time prekeys.
    async fn fetch_prekey_bundle(
        &self,
        target: &PeerAddress,
        requester_registration_id: RegistrationId,
    ) -> Result<PreKeyBundle, RemoteError>;

    /// Submit a ciphertext for delivery.
    async fn send_message(&self, message: OutboundMessage) -> Result<(), RemoteError>;

    /// Pending messages for `address`, oldest first.
    async fn fetch_messages(
        &self,
        address: &PeerAddress,
        registration_id: RegistrationId,
    ) -> Result<Vec<RelayMessage>, RemoteError>;

    /// Delete messages by id on behalf of `address`. One outcome per id, in
    /// request order.
    async fn delete_messages(
        &self,
        address: &PeerAddress,
        ids: &[u64],
    ) -> Result<Vec<DeleteOutcome>, RemoteError>;

    /// Add one-time prekeys to the pool of `address`.
    async fn upload_prekeys(
        &self,
        address: &PeerAddress,
        prekeys: Vec<PublicPreKey>,
    ) -> Result<(), RemoteError>;

    /// Replace the signed prekey of `address`.
    async fn upload_signed_prekey(
        &self,
        address: &PeerAddress,
        signed_prekey: PublicSignedPreKey,
    ) -> Result<(), RemoteError>;

    /// Remove the device record of `address`.
    async fn delete_device(&self, address: &PeerAddress) -> Result<(), RemoteError>;
}
