//! Runs messenger operations on the tokio runtime.

use std::{sync::Arc, time::Duration};

use pinpoint_core::{Environment, KeyValueStore};
use pinpoint_crypto::SessionEngine;
use pinpoint_proto::{IdentityKey, Location, PeerAddress};
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{BroadcastReport, Messenger, MessengerError, MessengerEvent, ReceiveReport};

/// Cloneable handle that offloads each operation to a runtime task.
///
/// Every method returns immediately with a [`JoinHandle`] resolving to the
/// operation's result. Must be called from within a tokio runtime.
pub struct MessengerHandle<K: KeyValueStore, G: SessionEngine, E: Environment> {
    messenger: Arc<Messenger<K, G, E>>,
}

impl<K: KeyValueStore, G: SessionEngine, E: Environment> Clone for MessengerHandle<K, G, E> {
    fn clone(&self) -> Self {
        Self { messenger: Arc::clone(&self.messenger) }
    }
}

impl<K: KeyValueStore, G: SessionEngine, E: Environment> MessengerHandle<K, G, E> {
    /// Take ownership of `messenger`.
    pub fn new(messenger: Messenger<K, G, E>) -> Self {
        Self { messenger: Arc::new(messenger) }
    }

    /// The wrapped messenger, for synchronous reads.
    pub fn messenger(&self) -> &Messenger<K, G, E> {
        &self.messenger
    }

    /// Subscribe to messenger events.
    pub fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        self.messenger.subscribe()
    }

    /// See [`Messenger::create_device`].
    pub fn create_device(&self) -> JoinHandle<Result<IdentityKey, MessengerError>> {
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move { messenger.create_device().await })
    }

    /// See [`Messenger::delete_device`].
    pub fn delete_device(&self) -> JoinHandle<Result<(), MessengerError>> {
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move { messenger.delete_device().await })
    }

    /// See [`Messenger::reset_local_state`].
    pub fn reset_local_state(&self) -> JoinHandle<Result<usize, MessengerError>> {
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move { messenger.reset_local_state().await })
    }

    /// See [`Messenger::send_location`].
    pub fn send_location(
        &self,
        recipient: PeerAddress,
        location: Location,
    ) -> JoinHandle<Result<(), MessengerError>> {
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move { messenger.send_location(&recipient, &location).await })
    }

    /// See [`Messenger::receive_and_reconcile`].
    pub fn receive_and_reconcile(&self) -> JoinHandle<Result<ReceiveReport, MessengerError>> {
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move { messenger.receive_and_reconcile().await })
    }

    /// See [`Messenger::run_maintenance`].
    pub fn run_maintenance(&self) -> JoinHandle<Result<(), MessengerError>> {
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move { messenger.run_maintenance().await })
    }

    /// See [`Messenger::accept_new_identity`].
    pub fn accept_new_identity(&self, peer: PeerAddress) -> JoinHandle<Result<bool, MessengerError>> {
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move { messenger.accept_new_identity(&peer).await })
    }

    /// See [`Messenger::start_live_sharing`].
    pub fn start_live_sharing(
        &self,
        recipient: PeerAddress,
        expiry_ms: u64,
    ) -> JoinHandle<Result<(), MessengerError>> {
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move { messenger.start_live_sharing(&recipient, expiry_ms) })
    }

    /// See [`Messenger::stop_live_sharing`].
    pub fn stop_live_sharing(&self, recipient: PeerAddress) -> JoinHandle<Result<bool, MessengerError>> {
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move { messenger.stop_live_sharing(&recipient) })
    }

    /// See [`Messenger::broadcast_location`].
    pub fn broadcast_location(
        &self,
        location: Location,
    ) -> JoinHandle<Result<BroadcastReport, MessengerError>> {
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move { messenger.broadcast_location(&location).await })
    }

    /// See [`Messenger::run_live_sharing`].
    pub fn run_live_sharing<F>(
        &self,
        interval: Duration,
        position: F,
    ) -> JoinHandle<Result<usize, MessengerError>>
    where
        F: FnMut(u64) -> Location + Send + 'static,
    {
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move { messenger.run_live_sharing(interval, position).await })
    }
}
