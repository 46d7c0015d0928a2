//! Per-request deadlines for a [`Directory`].

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use pinpoint_core::Directory;
use pinpoint_proto::{
    DeleteOutcome, DeviceRegistration, OutboundMessage, PeerAddress, PreKeyBundle, PublicPreKey,
    PublicSignedPreKey, RegistrationId, RelayMessage, RemoteError,
};

/// Wraps a directory so every request fails with [`RemoteError::Timeout`]
/// instead of hanging past the deadline.
#[derive(Clone)]
pub struct TimedDirectory {
    inner: Arc<dyn Directory>,
    timeout: Duration,
}

impl TimedDirectory {
    /// Bound every request to `inner` by `timeout`.
    pub fn new(inner: Arc<dyn Directory>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        request: &'static str,
        future: impl Future<Output = Result<T, RemoteError>> + Send,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(request, timeout_ms = self.timeout.as_millis() as u64, "request timed out");
                Err(RemoteError::Timeout)
            },
        }
    }
}

#[async_trait]
impl Directory for TimedDirectory {
    async fn create_device(&self, registration: DeviceRegistration) -> Result<(), RemoteError> {
        self.bounded("create_device", self.inner.create_device(registration)).await
    }

    async fn fetch_prekey_bundle(
        &self,
        target: &PeerAddress,
        requester_registration_id: RegistrationId,
    ) -> Result<PreKeyBundle, RemoteError> {
        self.bounded(
            "fetch_prekey_bundle",
            self.inner.fetch_prekey_bundle(target, requester_registration_id),
        )
        .await
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<(), RemoteError> {
        self.bounded("send_message", self.inner.send_message(message)).await
    }

    async fn fetch_messages(
        &self,
        address: &PeerAddress,
        registration_id: RegistrationId,
    ) -> Result<Vec<RelayMessage>, RemoteError> {
        self.bounded("fetch_messages", self.inner.fetch_messages(address, registration_id)).await
    }

    async fn delete_messages(
        &self,
        address: &PeerAddress,
        ids: &[u64],
    ) -> Result<Vec<DeleteOutcome>, RemoteError> {
        self.bounded("delete_messages", self.inner.delete_messages(address, ids)).await
    }

    async fn upload_prekeys(
        &self,
        address: &PeerAddress,
        prekeys: Vec<PublicPreKey>,
    ) -> Result<(), RemoteError> {
        self.bounded("upload_prekeys", self.inner.upload_prekeys(address, prekeys)).await
    }

    async fn upload_signed_prekey(
        &self,
        address: &PeerAddress,
        signed_prekey: PublicSignedPreKey,
    ) -> Result<(), RemoteError> {
        self.bounded("upload_signed_prekey", self.inner.upload_signed_prekey(address, signed_prekey))
            .await
    }

    async fn delete_device(&self, address: &PeerAddress) -> Result<(), RemoteError> {
        self.bounded("delete_device", self.inner.delete_device(address)).await
    }
}
