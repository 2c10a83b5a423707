//! Dispatcher configuration and timing constants.

use std::time::Duration;

use drover_core::config::ChannelConfig;
use drover_core::process::WorkerSpec;
use serde::{Deserialize, Serialize};

/// Graceful-cancel window applied when a cancel arrives without a timeout,
/// and the floor applied to every caller-supplied timeout.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(60);

/// Padding between the graceful cancel and the forced kill. The kill
/// deadline fires this much before the caller's window ends so the
/// completion reporter still has time to run.
pub const KILL_GRACE_PADDING: Duration = Duration::from_secs(15);

/// Upper bound on a cancel timeout, keeping the scheduled deadline inside
/// the timer primitive's integer range.
pub const MAX_CANCEL_TIMEOUT: Duration = Duration::from_secs(35_790 * 60);

/// Window a previous dispatch's worker gets to exit once the server has
/// declared its request finished.
pub const PREVIOUS_EXIT_GRACE: Duration = Duration::from_secs(45);

/// Timeout for the connection refresh performed before the first renewal.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Dispatcher configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Agent pool the job requests belong to.
    pub pool_id: u64,

    /// Worker channel settings.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Worker spawn settings.
    #[serde(default)]
    pub worker: WorkerSpec,
}

impl DispatchConfig {
    /// Builds a configuration for `pool_id`, reading the channel timeout
    /// override from the environment.
    #[must_use]
    pub fn from_env(pool_id: u64) -> Self {
        Self {
            pool_id,
            channel: ChannelConfig::from_env(),
            worker: WorkerSpec::default(),
        }
    }
}
