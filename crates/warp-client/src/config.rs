use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Initial online state. Offline clients park reconnect timers.
    pub keep_online: bool,
    /// First reconnect delay after a transport failure.
    #[serde(with = "humantime_serde")]
    pub reconnect_initial: Duration,
    /// Upper bound for the doubling reconnect delay.
    #[serde(with = "humantime_serde")]
    pub reconnect_max: Duration,
    /// Time allowed between sending `link`/`sync` and the matching
    /// `linked`/`synced`. Zero disables the check.
    #[serde(with = "humantime_serde")]
    pub link_timeout: Duration,
    /// How long a host with no attached downlinks and nothing queued stays
    /// open before it is torn down.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Delay before relinking a lane the server unlinked.
    #[serde(with = "humantime_serde")]
    pub relink_delay: Duration,
    /// Per-host bound on queued outbound envelopes. When full, the oldest
    /// queued command is dropped. `None` leaves the queue unbounded.
    pub max_outbound_queue: Option<usize>,
    /// Interval used by [`crate::ClientRunner`] between polls.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_online: true,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            link_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(1),
            relink_delay: Duration::from_millis(500),
            max_outbound_queue: None,
            tick_interval: Duration::from_millis(10),
        }
    }
}

impl ClientConfig {
    /// Reconnect delay for the given zero-based attempt:
    /// `min(reconnect_max, reconnect_initial * 2^attempt)`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.reconnect_initial
            .checked_mul(factor)
            .map_or(self.reconnect_max, |delay| delay.min(self.reconnect_max))
    }
}
