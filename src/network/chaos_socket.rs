//! A configurable socket wrapper for network fault injection testing.
//!
//! [`ChaosSocket`] wraps any [`NonBlockingSocket`] implementation to simulate
//! adverse network conditions: latency, jitter, packet loss, duplication and
//! scripted drops of individual datagrams. The random decisions come from a
//! seeded [`Pcg32`], so a scenario replays identically with the same seed.
//!
//! # Example
//!
//! ```rust
//! use rollback_netcode::{ChaosConfig, ChaosSocket, LoopbackNetwork};
//! use std::time::Duration;
//!
//! let config = ChaosConfig::builder()
//!     .latency(Duration::from_millis(50))
//!     .jitter(Duration::from_millis(10))
//!     .packet_loss_rate(0.05)
//!     .seed(42)
//!     .build();
//!
//! let network = LoopbackNetwork::new();
//! let inner = network.socket("127.0.0.1:7000".parse().unwrap());
//! let socket = ChaosSocket::new(inner, config);
//! assert_eq!(socket.packets_in_flight(), 0);
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use web_time::Instant;

use crate::network::messages::Message;
use crate::rng::Pcg32;
use crate::NonBlockingSocket;

/// Configuration for network chaos simulation.
///
/// Use [`ChaosConfig::builder()`] for a fluent configuration API.
/// All durations default to zero and all rates default to 0.0 (no effect).
#[derive(Debug, Clone, PartialEq)]
pub struct ChaosConfig {
    /// Base latency added to all received packets (default: 0ms)
    pub latency: Duration,

    /// Maximum random jitter added/subtracted from latency (default: 0ms)
    /// Actual jitter is uniformly distributed in [-jitter, +jitter]
    pub jitter: Duration,

    /// Probability of dropping a packet on send (0.0 - 1.0, default: 0.0)
    pub send_loss_rate: f64,

    /// Probability of dropping a packet on receive (0.0 - 1.0, default: 0.0)
    pub receive_loss_rate: f64,

    /// Probability of duplicating a packet (0.0 - 1.0, default: 0.0)
    pub duplication_rate: f64,

    /// Sends with these 1-based indices are dropped, regardless of the loss rates.
    pub drop_sends: Vec<u64>,

    /// Random seed for deterministic behavior (default: random)
    pub seed: Option<u64>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            send_loss_rate: 0.0,
            receive_loss_rate: 0.0,
            duplication_rate: 0.0,
            drop_sends: Vec::new(),
            seed: None,
        }
    }
}

impl ChaosConfig {
    /// Creates a new builder for fluent configuration.
    #[must_use]
    pub fn builder() -> ChaosConfigBuilder {
        ChaosConfigBuilder::new()
    }

    /// Creates a config with no chaos (passthrough mode).
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Creates a config simulating high latency conditions.
    #[must_use]
    pub fn high_latency(latency_ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(latency_ms),
            ..Default::default()
        }
    }

    /// Creates a config simulating packet loss.
    #[must_use]
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            send_loss_rate: loss_rate.clamp(0.0, 1.0),
            receive_loss_rate: loss_rate.clamp(0.0, 1.0),
            ..Default::default()
        }
    }

    /// Creates a config simulating typical poor network conditions.
    #[must_use]
    pub fn poor_network() -> Self {
        Self {
            latency: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
            send_loss_rate: 0.05,
            receive_loss_rate: 0.05,
            ..Default::default()
        }
    }
}

/// Builder for [`ChaosConfig`].
#[derive(Debug, Clone, Default)]
pub struct ChaosConfigBuilder {
    config: ChaosConfig,
}

impl ChaosConfigBuilder {
    /// Creates a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base latency for all packets.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.config.latency = latency;
        self
    }

    /// Sets the latency in milliseconds (convenience method).
    #[must_use]
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.config.latency = Duration::from_millis(ms);
        self
    }

    /// Sets the maximum jitter (random variation in latency).
    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Sets packet loss rate for both send and receive.
    #[must_use]
    pub fn packet_loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets packet loss rate for sending only.
    #[must_use]
    pub fn send_loss_rate(mut self, rate: f64) -> Self {
        self.config.send_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets packet loss rate for receiving only.
    #[must_use]
    pub fn receive_loss_rate(mut self, rate: f64) -> Self {
        self.config.receive_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the packet duplication rate.
    #[must_use]
    pub fn duplication_rate(mut self, rate: f64) -> Self {
        self.config.duplication_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Drops the `n`-th send (1-based). Can be called multiple times.
    #[must_use]
    pub fn drop_nth_send(mut self, n: u64) -> Self {
        self.config.drop_sends.push(n);
        self
    }

    /// Sets the random seed for deterministic behavior.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ChaosConfig {
        self.config
    }
}

/// A packet in flight with its scheduled delivery time.
#[derive(Debug, Clone)]
struct InFlightPacket {
    addr: SocketAddr,
    msg: Message,
    deliver_at: Instant,
}

/// Statistics about chaos socket behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Total packets sent through the socket
    pub packets_sent: u64,
    /// Packets dropped on send, by loss rate or scripted drop
    pub packets_dropped_send: u64,
    /// Packets duplicated on send
    pub packets_duplicated: u64,
    /// Total packets handed to the caller
    pub packets_received: u64,
    /// Packets dropped on receive
    pub packets_dropped_receive: u64,
}

/// A socket wrapper that injects configurable network chaos.
///
/// Latency and jitter are applied on the receiving side: incoming packets are held back until
/// their delivery time has passed.
#[derive(Debug)]
pub struct ChaosSocket<S: NonBlockingSocket> {
    inner: S,
    config: ChaosConfig,
    rng: Pcg32,
    in_flight: VecDeque<InFlightPacket>,
    stats: ChaosStats,
}

impl<S: NonBlockingSocket> ChaosSocket<S> {
    /// Creates a new chaos socket wrapping the given inner socket.
    pub fn new(inner: S, config: ChaosConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => Pcg32::seed_from_u64(seed),
            None => Pcg32::from_entropy(),
        };

        Self {
            inner,
            config,
            rng,
            in_flight: VecDeque::new(),
            stats: ChaosStats::default(),
        }
    }

    /// Returns a reference to the inner socket.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner socket.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Returns the current chaos configuration.
    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Updates the chaos configuration. Packets already in flight keep their delivery time.
    pub fn set_config(&mut self, config: ChaosConfig) {
        self.config = config;
    }

    /// Returns statistics about chaos behavior.
    pub fn stats(&self) -> ChaosStats {
        self.stats
    }

    /// Returns the number of packets currently in flight (delayed).
    pub fn packets_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn calculate_delivery_time(&mut self) -> Instant {
        let now = Instant::now();
        let base_latency = self.config.latency;
        let jitter_ms = u32::try_from(self.config.jitter.as_millis()).unwrap_or(u32::MAX / 2);
        if jitter_ms == 0 {
            return now + base_latency;
        }
        let offset = i64::from(self.rng.gen_range(0..jitter_ms.saturating_mul(2).saturating_add(1)))
            - i64::from(jitter_ms);
        if offset >= 0 {
            now + base_latency + Duration::from_millis(offset as u64)
        } else {
            // negative jitter never delivers before "now"
            now + base_latency.saturating_sub(Duration::from_millis(offset.unsigned_abs()))
        }
    }

    fn should_drop(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            false
        } else {
            self.rng.gen_bool(rate)
        }
    }

    fn deliver_ready_packets(&mut self) -> Vec<(SocketAddr, Message)> {
        let now = Instant::now();
        let mut ready = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.in_flight.len());
        for packet in self.in_flight.drain(..) {
            if packet.deliver_at <= now {
                ready.push((packet.addr, packet.msg));
            } else {
                waiting.push_back(packet);
            }
        }
        self.in_flight = waiting;
        ready
    }
}

impl<S: NonBlockingSocket> NonBlockingSocket for ChaosSocket<S> {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        self.stats.packets_sent += 1;

        if self.config.drop_sends.contains(&self.stats.packets_sent) {
            tracing::debug!(
                index = self.stats.packets_sent,
                kind = msg.kind(),
                "chaos socket dropping scripted send"
            );
            self.stats.packets_dropped_send += 1;
            return;
        }

        if self.should_drop(self.config.send_loss_rate) {
            self.stats.packets_dropped_send += 1;
            return;
        }

        self.inner.send_to(msg, addr);

        if self.should_drop(self.config.duplication_rate) {
            self.stats.packets_duplicated += 1;
            self.inner.send_to(msg, addr);
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        for (addr, msg) in self.inner.receive_all_messages() {
            if self.should_drop(self.config.receive_loss_rate) {
                self.stats.packets_dropped_receive += 1;
                continue;
            }

            let deliver_at = self.calculate_delivery_time();
            self.in_flight.push_back(InFlightPacket {
                addr,
                msg,
                deliver_at,
            });
        }

        let ready = self.deliver_ready_packets();
        self.stats.packets_received += ready.len() as u64;
        ready
    }
}
