//! Client
//!
//! Messaging orchestrator for Pinpoint: device lifecycle, sending locations,
//! the receive-and-reconcile cycle, live sharing and key maintenance, built
//! on the components in [`pinpoint_core`].
//!
//! # Architecture
//!
//! A [`Messenger`] owns one local device's store, session engine,
//! environment and directory. Each operation is a future that runs its
//! directory requests strictly one after another under a per-request
//! deadline. [`MessengerHandle`] offloads operations onto the tokio runtime
//! and hands back [`JoinHandle`](tokio::task::JoinHandle)s.
//!
//! Failures the application must act on (expired credentials, our own
//! device replaced, a peer identity change) are returned as errors and also
//! published as [`MessengerEvent`]s.
//!
//! # Components
//!
//! - [`Messenger`]: Per-device orchestrator
//! - [`MessengerHandle`]: Runtime-offloading wrapper
//! - [`MessengerConfig`]: Timeouts, rotation policy, event capacity
//! - [`TimedDirectory`]: Per-request deadlines
//! - [`SystemEnv`]: Production environment (system clock, OS RNG)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod error;
mod event;
mod messenger;
mod system_env;
mod timed;
mod worker;

pub use config::MessengerConfig;
pub use error::MessengerError;
pub use event::MessengerEvent;
pub use messenger::{BroadcastReport, Messenger, ReceiveReport};
pub use pinpoint_core::{Directory, Environment, RotationPolicy};
pub use system_env::SystemEnv;
pub use timed::TimedDirectory;
pub use worker::MessengerHandle;
