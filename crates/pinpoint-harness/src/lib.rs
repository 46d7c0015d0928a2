//! Deterministic simulation harness for Pinpoint client testing.
//!
//! In-process implementations of the Environment and Directory traits for
//! deterministic, reproducible tests of whole messaging flows.
//!
//! # Components
//!
//! - [`SimEnv`]: Seeded ChaCha RNG and a manually advanced wall clock
//! - [`SimDirectory`]: In-memory directory and relay with fault injection
//! - [`SimWorld`]: Shared clock and relay for several simulated devices

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_directory;
pub mod sim_env;
pub mod world;

pub use sim_directory::{PREKEY_POOL_LIMIT, Request, SimDirectory};
pub use sim_env::{SIM_EPOCH_MS, SimEnv};
pub use world::{SimMessenger, SimWorld};
