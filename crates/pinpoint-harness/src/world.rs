//! Simulated world: one clock, one relay, any number of devices.

use std::sync::Arc;

use pinpoint_client::{Messenger, MessengerConfig, MessengerError};
use pinpoint_core::{Environment, KeyValueStore, MemoryStore};
use pinpoint_crypto::DoubleRatchetEngine;
use pinpoint_proto::{Location, PeerAddress, ProtocolError};

use crate::{SimDirectory, SimEnv};

/// Messenger backed by memory storage in a simulated world.
pub type SimMessenger = Messenger<MemoryStore, DoubleRatchetEngine, SimEnv>;

/// Shared environment and relay for a set of simulated devices.
pub struct SimWorld {
    /// Clock and RNG shared by every device.
    pub env: SimEnv,
    /// Relay shared by every device.
    pub directory: SimDirectory,
    config: MessengerConfig,
}

impl SimWorld {
    /// World with default messenger configuration.
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, MessengerConfig::default())
    }

    /// World whose messengers use `config`.
    pub fn with_config(seed: u64, config: MessengerConfig) -> Self {
        Self { env: SimEnv::with_seed(seed), directory: SimDirectory::new(), config }
    }

    /// Messenger for `name.slot` with fresh memory storage. No device is
    /// created.
    pub fn messenger(&self, name: &str, slot: u32) -> SimMessenger {
        self.messenger_on(PeerAddress::new(name, slot), MemoryStore::new())
    }

    /// Messenger for `address` persisting into `kv`.
    pub fn messenger_on<K: KeyValueStore>(
        &self,
        address: PeerAddress,
        kv: K,
    ) -> Messenger<K, DoubleRatchetEngine, SimEnv> {
        Messenger::new(
            address,
            kv,
            DoubleRatchetEngine,
            self.env.clone(),
            Arc::new(self.directory.clone()),
            self.config,
        )
    }

    /// Messenger for `name.slot` with a registered device.
    pub async fn device(&self, name: &str, slot: u32) -> Result<SimMessenger, MessengerError> {
        let messenger = self.messenger(name, slot);
        messenger.create_device().await?;
        Ok(messenger)
    }

    /// Location stamped with the current simulated time.
    pub fn location(&self, latitude: f64, longitude: f64) -> Result<Location, ProtocolError> {
        Location::new(latitude, longitude, 10, self.env.wall_clock_ms())
    }
}
