//! Worker channel configuration.
//!
//! The only tunable the channel exposes is the IPC send timeout. It is
//! deliberately clamped: a timeout under 30 seconds races slow worker
//! startup on loaded machines, and one over 300 seconds holds a dead job
//! open long past the point the server has given up on it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the worker IPC send timeout, in seconds.
pub const CHANNEL_TIMEOUT_ENV: &str = "VSTS_AGENT_CHANNEL_TIMEOUT";

/// Lower clamp for the IPC send timeout.
pub const MIN_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper clamp for the IPC send timeout.
pub const MAX_CHANNEL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default IPC send timeout.
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Timeout applied to every control message sent to the worker.
    #[serde(default = "default_send_timeout")]
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
}

const fn default_send_timeout() -> Duration {
    DEFAULT_CHANNEL_TIMEOUT
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_CHANNEL_TIMEOUT,
        }
    }
}

impl ChannelConfig {
    /// Builds the configuration from the process environment.
    ///
    /// [`CHANNEL_TIMEOUT_ENV`] overrides the default send timeout; values
    /// outside [`MIN_CHANNEL_TIMEOUT`]..=[`MAX_CHANNEL_TIMEOUT`] are clamped
    /// rather than rejected, and unparseable values fall back to the
    /// default.
    #[must_use]
    pub fn from_env() -> Self {
        let send_timeout = std::env::var(CHANNEL_TIMEOUT_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map_or(DEFAULT_CHANNEL_TIMEOUT, |secs| {
                clamp_channel_timeout(Duration::from_secs(secs))
            });
        Self { send_timeout }
    }

    /// Returns a copy with the send timeout clamped into the supported
    /// range.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.send_timeout = clamp_channel_timeout(self.send_timeout);
        self
    }
}

/// Clamps a channel timeout into [`MIN_CHANNEL_TIMEOUT`]..=[`MAX_CHANNEL_TIMEOUT`].
#[must_use]
pub fn clamp_channel_timeout(timeout: Duration) -> Duration {
    timeout.clamp(MIN_CHANNEL_TIMEOUT, MAX_CHANNEL_TIMEOUT)
}
