//! Messenger configuration.

use std::time::Duration;

use pinpoint_core::RotationPolicy;

/// Messenger configuration.
#[derive(Debug, Clone, Copy)]
pub struct MessengerConfig {
    /// Deadline for each directory request. Expiry yields a timeout error.
    pub request_timeout: Duration,
    /// Prekey floor and signed prekey age.
    pub rotation: RotationPolicy,
    /// Buffered events per subscriber before the slowest one lags.
    pub event_capacity: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            rotation: RotationPolicy::default(),
            event_capacity: 64,
        }
    }
}
