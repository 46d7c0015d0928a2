//! Pinpoint demo binary.
//!
//! Runs two devices, alice and bob, against an in-process relay: alice
//! starts a live share with bob and broadcasts a location, bob answers with
//! a one-shot location, and both inboxes are logged.
//!
//! # Usage
//!
//! ```bash
//! # In-memory stores
//! pinpoint --latitude 52.52 --longitude 13.405
//!
//! # Durable stores; a rerun recovers from the relay having forgotten them
//! pinpoint --data-dir ./pinpoint-data --log-level debug
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use pinpoint_client::{
    Environment, Messenger, MessengerConfig, MessengerError, MessengerEvent, RotationPolicy,
    SystemEnv,
};
use pinpoint_core::{Directory, KeyValueStore, MemoryStore, RedbStore};
use pinpoint_crypto::DoubleRatchetEngine;
use pinpoint_harness::SimDirectory;
use pinpoint_proto::{ErrorKind, Location, PeerAddress};
use tokio::sync::broadcast::Receiver;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Pinpoint location sharing demo
#[derive(Parser, Debug)]
#[command(name = "pinpoint")]
#[command(about = "Share encrypted locations between two local devices")]
#[command(version)]
struct Args {
    /// Directory for durable device stores. In-memory if omitted.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Latitude alice shares, in degrees
    #[arg(long, default_value_t = 52.52, allow_negative_numbers = true)]
    latitude: f64,

    /// Longitude alice shares, in degrees
    #[arg(long, default_value_t = 13.405, allow_negative_numbers = true)]
    longitude: f64,

    /// Accuracy radius in meters
    #[arg(long, default_value_t = 25)]
    accuracy: u32,

    /// Live share duration in seconds
    #[arg(long, default_value_t = 900)]
    live_secs: u64,

    /// Per-request deadline in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Minimum one-time prekeys kept published
    #[arg(long, default_value_t = 50)]
    prekey_floor: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> MessengerConfig {
        MessengerConfig {
            request_timeout: Duration::from_millis(self.timeout_ms),
            rotation: RotationPolicy { prekey_floor: self.prekey_floor, ..RotationPolicy::default() },
            ..MessengerConfig::default()
        }
    }
}

type Device<K> = Messenger<K, DoubleRatchetEngine, SystemEnv>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let relay: Arc<dyn Directory> = Arc::new(SimDirectory::new());
    let (alice, bob) = (PeerAddress::new("alice", 1), PeerAddress::new("bob", 1));

    match &args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            tracing::info!(dir = %dir.display(), "using durable stores");
            let alice_store = RedbStore::open(dir.join("alice.redb"))?;
            let bob_store = RedbStore::open(dir.join("bob.redb"))?;
            run(&args, relay, (alice, alice_store), (bob, bob_store)).await?;
        },
        None => {
            tracing::info!("using in-memory stores");
            run(&args, relay, (alice, MemoryStore::new()), (bob, MemoryStore::new())).await?;
        },
    }

    Ok(())
}

async fn run<K: KeyValueStore>(
    args: &Args,
    relay: Arc<dyn Directory>,
    (alice_address, alice_store): (PeerAddress, K),
    (bob_address, bob_store): (PeerAddress, K),
) -> Result<(), MessengerError> {
    let env = SystemEnv::new();
    let config = args.config();
    let device = |address: PeerAddress, store: K| -> Device<K> {
        Messenger::new(address, store, DoubleRatchetEngine, env, Arc::clone(&relay), config)
    };

    let alice = device(alice_address.clone(), alice_store);
    let bob = device(bob_address.clone(), bob_store);
    let alice_events = alice.subscribe();
    let bob_events = bob.subscribe();

    bring_up(&alice).await?;
    bring_up(&bob).await?;

    let now_ms = env.wall_clock_ms();
    let shared = Location::new(args.latitude, args.longitude, args.accuracy, now_ms)
        .map_err(MessengerError::InvalidLocation)?;
    alice.start_live_sharing(&bob_address, now_ms + args.live_secs * 1_000)?;
    let broadcast = alice.broadcast_location(&shared).await?;
    tracing::info!(delivered = broadcast.delivered.len(), failed = broadcast.failed.len(), "alice broadcast");

    let report = bob.receive_and_reconcile().await?;
    tracing::info!(?report, "bob received");

    // Bob answers from a little further north.
    let reply = Location::new(
        (args.latitude + 0.01).min(90.0),
        args.longitude,
        args.accuracy,
        env.wall_clock_ms(),
    )
    .map_err(MessengerError::InvalidLocation)?;
    bob.send_location(&alice_address, &reply).await?;

    let report = alice.receive_and_reconcile().await?;
    tracing::info!(?report, "alice received");

    log_inbox(&alice)?;
    log_inbox(&bob)?;

    alice.stop_live_sharing(&bob_address)?;
    drain_events(alice.local_address(), alice_events);
    drain_events(bob.local_address(), bob_events);
    Ok(())
}

/// Create the device, or recreate it if the relay no longer knows it.
async fn bring_up<K: KeyValueStore>(device: &Device<K>) -> Result<(), MessengerError> {
    if device.has_local_device()? {
        match device.receive_and_reconcile().await {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::RemoteDeviceChanged => {
                tracing::warn!(address = %device.local_address(), "relay forgot device, recreating");
                device.reset_local_state().await?;
            },
            Err(e) => return Err(e),
        }
    }

    let identity = device.create_device().await?;
    tracing::info!(
        address = %device.local_address(),
        fingerprint = %identity.fingerprint(),
        "device ready"
    );
    Ok(())
}

fn log_inbox<K: KeyValueStore>(device: &Device<K>) -> Result<(), MessengerError> {
    let summary = device.summaries()?;
    for row in &summary.entries {
        let location = device.message(&row.sender)?.and_then(|m| m.location().copied());
        tracing::info!(
            inbox = %device.local_address(),
            from = %row.sender,
            live = row.is_live,
            error = row.is_error,
            latitude = location.map(|l| l.latitude),
            longitude = location.map(|l| l.longitude),
            "inbox entry"
        );
    }
    Ok(())
}

fn drain_events(address: &PeerAddress, mut events: Receiver<MessengerEvent>) {
    while let Ok(event) = events.try_recv() {
        tracing::info!(device = %address, ?event, "event");
    }
}
