//! Configuration types for sessions.
//!
//! | Config Type | Purpose | Presets |
//! |-------------|---------|---------|
//! | `SyncConfig` | Handshake and retry timing | `lan()`, `high_latency()` |
//! | `ProtocolConfig` | Quality probes, shutdown, redundancy limit | `deterministic(seed)` |
//!
//! ```
//! use rollback_netcode::{ProtocolConfig, SessionBuilder, SyncConfig};
//!
//! let builder = SessionBuilder::new(2, 4)
//!     .with_sync_config(SyncConfig::lan())
//!     .with_protocol_config(ProtocolConfig::deterministic(7));
//! # drop(builder);
//! ```

use web_time::Duration;

use crate::NetcodeError;

/// Configuration for the synchronization handshake and the retransmission timers of a running
/// connection.
///
/// New fields may be added later, so construct instances with `..SyncConfig::default()`.
///
/// ```
/// use rollback_netcode::SyncConfig;
/// use web_time::Duration;
///
/// let lossy = SyncConfig {
///     num_sync_packets: 8,
///     sync_retry_interval: Duration::from_millis(500),
///     ..SyncConfig::default()
/// };
/// assert!(lossy.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SyncConfig has no effect unless passed to SessionBuilder::with_sync_config()"]
pub struct SyncConfig {
    /// Successful roundtrips required before the peer counts as synchronized.
    ///
    /// Default: 5
    pub num_sync_packets: u32,

    /// Retry interval while no sync reply has arrived at all.
    ///
    /// Default: 500ms
    pub sync_first_retry_interval: Duration,

    /// Retry interval once the peer answered at least once.
    ///
    /// Default: 2000ms
    pub sync_retry_interval: Duration,

    /// Time between input retransmissions while running, if no input arrived from the peer.
    ///
    /// Default: 200ms
    pub running_retry_interval: Duration,

    /// Time without any outgoing packet after which a keepalive is sent.
    ///
    /// Default: 200ms
    pub keepalive_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_sync_packets: 5,
            sync_first_retry_interval: Duration::from_millis(500),
            sync_retry_interval: Duration::from_millis(2000),
            running_retry_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(200),
        }
    }
}

impl SyncConfig {
    /// Creates a new `SyncConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local networks: fewer roundtrips and short retries.
    pub fn lan() -> Self {
        Self {
            num_sync_packets: 3,
            sync_first_retry_interval: Duration::from_millis(100),
            sync_retry_interval: Duration::from_millis(200),
            running_retry_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
        }
    }

    /// Preset for connections with 100-200ms RTT.
    ///
    /// Longer intervals avoid flooding the link with retries that are still in flight.
    pub fn high_latency() -> Self {
        Self {
            num_sync_packets: 5,
            sync_first_retry_interval: Duration::from_millis(1000),
            sync_retry_interval: Duration::from_millis(3000),
            running_retry_interval: Duration::from_millis(400),
            keepalive_interval: Duration::from_millis(400),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `NetcodeError::InvalidRequest` for zero roundtrips or zero intervals.
    pub fn validate(&self) -> Result<(), NetcodeError> {
        if self.num_sync_packets == 0 {
            return Err(NetcodeError::InvalidRequest {
                info: "num_sync_packets must be at least 1".to_owned(),
            });
        }
        for (field, value) in [
            ("sync_first_retry_interval", self.sync_first_retry_interval),
            ("sync_retry_interval", self.sync_retry_interval),
            ("running_retry_interval", self.running_retry_interval),
            ("keepalive_interval", self.keepalive_interval),
        ] {
            if value.is_zero() {
                return Err(NetcodeError::InvalidRequest {
                    info: format!("{field} must not be zero"),
                });
            }
        }
        Ok(())
    }
}

/// Configuration of the peer protocol beyond the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ProtocolConfig has no effect unless passed to SessionBuilder::with_protocol_config()"]
pub struct ProtocolConfig {
    /// Interval between quality reports, which measure the RTT and exchange frame advantages.
    ///
    /// Default: 1000ms
    pub quality_report_interval: Duration,

    /// Interval at which the bandwidth estimate of [`NetworkStats`](crate::NetworkStats) is
    /// refreshed.
    ///
    /// Default: 1000ms
    pub network_stats_interval: Duration,

    /// Time spent in the disconnected state before the endpoint shuts down for good.
    ///
    /// Default: 5000ms
    pub shutdown_delay: Duration,

    /// Unacknowledged inputs kept for retransmission. A peer exceeding this is disconnected.
    ///
    /// Default: 128
    pub pending_output_limit: usize,

    /// Seed for handshake tokens and magic numbers. `None` seeds from entropy.
    ///
    /// Default: `None`
    pub protocol_rng_seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(1000),
            network_stats_interval: Duration::from_millis(1000),
            shutdown_delay: Duration::from_millis(5000),
            pending_output_limit: 128,
            protocol_rng_seed: None,
        }
    }
}

impl ProtocolConfig {
    /// Creates a new `ProtocolConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default settings with a fixed rng seed.
    ///
    /// ```
    /// use rollback_netcode::ProtocolConfig;
    ///
    /// let config = ProtocolConfig::deterministic(42);
    /// assert_eq!(config.protocol_rng_seed, Some(42));
    /// ```
    pub fn deterministic(seed: u64) -> Self {
        Self {
            protocol_rng_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Validates the protocol configuration.
    ///
    /// # Errors
    ///
    /// Returns `NetcodeError::InvalidRequest` if any configuration value is out of range.
    pub fn validate(&self) -> Result<(), NetcodeError> {
        if self.quality_report_interval.is_zero() || self.network_stats_interval.is_zero() {
            return Err(NetcodeError::InvalidRequest {
                info: "quality and stats intervals must not be zero".to_owned(),
            });
        }
        if !(1..=4096).contains(&self.pending_output_limit) {
            return Err(NetcodeError::InvalidRequest {
                info: format!(
                    "pending_output_limit {} is outside 1..=4096",
                    self.pending_output_limit
                ),
            });
        }
        Ok(())
    }
}
