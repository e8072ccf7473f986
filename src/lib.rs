//! # rollback-netcode
//!
//! A GGPO-style peer-to-peer rollback networking engine written in 100% safe Rust.
//!
//! The host application drives a session from its frame loop: it hands local input to the
//! session with `add_local_input`, fetches the inputs of every player with `synchronize_input`,
//! simulates one frame and then calls `advance_frame`. Remote input that has not arrived yet is
//! predicted. Whenever a prediction turns out to be wrong, the session loads the last correct
//! snapshot through [`SessionCallbacks::load_game_state`] and replays the affected frames through
//! [`SessionCallbacks::advance_frame`] before returning control to the host.
//!
//! Network traffic is polled, never awaited: call `idle` once per frame to let the session
//! exchange packets with its peers.

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::net::{IpAddr, SocketAddr};

pub use error::{succeeded, ErrorCode, NetcodeError};
pub use frame_info::{GameInput, SavedState, SynchronizedInputs};
pub use network::chaos_socket::{ChaosConfig, ChaosSocket, ChaosStats};
pub use network::loopback::{LoopbackNetwork, LoopbackSocket};
pub use network::messages::Message;
pub use network::network_stats::NetworkStats;
pub use network::udp_socket::UdpNonBlockingSocket;
pub use sessions::builder::{start_session, start_spectating, start_synctest, SessionBuilder};
pub use sessions::config::{ProtocolConfig, SyncConfig};
pub use sessions::p2p_session::P2PSession;
pub use sessions::session_trait::Session;
pub use sessions::spectator_session::SpectatorSession;
pub use sessions::sync_test_session::SyncTestSession;
pub use telemetry::{CollectingObserver, TracingObserver, Violation, ViolationObserver};
pub use time_sync::TimeSyncConfig;

#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
pub mod hash;
#[doc(hidden)]
pub mod input_queue;
/// Minimal PCG32 random number generator used for handshake tokens and fault injection.
pub mod rng;
#[doc(hidden)]
pub mod sync_layer;
pub mod telemetry;
#[doc(hidden)]
pub mod time_sync;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod config;
    #[doc(hidden)]
    pub mod p2p_session;
    #[doc(hidden)]
    pub mod player_registry;
    #[doc(hidden)]
    pub mod session_trait;
    #[doc(hidden)]
    pub mod spectator_session;
    #[doc(hidden)]
    pub mod sync_test_session;
}
#[doc(hidden)]
pub mod network {
    pub mod chaos_socket;
    /// Binary codec for network message serialization.
    pub mod codec;
    #[doc(hidden)]
    pub mod compression;
    pub mod loopback;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[doc(hidden)]
    pub mod protocol;
    #[doc(hidden)]
    pub mod udp_socket;
}

/// Internal module exposing implementation details for integration tests and benchmarks.
///
/// Nothing in here is covered by semver guarantees.
#[doc(hidden)]
pub mod __internal {
    pub use crate::input_queue::{InputQueue, INPUT_QUEUE_LENGTH};
    pub use crate::network::compression::{decode, delta_decode, delta_encode, encode};
    pub use crate::network::messages::ConnectionStatus;
    pub use crate::network::protocol::{Event, ProtocolState, UdpProtocol};
    pub use crate::sync_layer::{SavedStates, SyncLayer};
    pub use crate::time_sync::TimeSync;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// The maximum number of players a session can be started with.
pub const MAX_PLAYERS: usize = 4;

/// The number of frames a session may simulate ahead of the last confirmed frame.
/// This is also the capacity of the save-state ring.
pub const MAX_PREDICTION_FRAMES: usize = 8;

/// The maximum number of spectators a P2P host accepts.
pub const MAX_SPECTATORS: usize = 32;

/// How many confirmed frames a host sends to its spectators in one go while catching them up.
pub const SPECTATOR_INPUT_INTERVAL: usize = 4;

/// Spectator handles are numbered from this offset, so they never collide with player handles.
pub const SPECTATOR_HANDLE_OFFSET: usize = 1000;

/// Sentinel value for "no handle" in the numeric handle space of the host contract.
pub const INVALID_HANDLE: i32 = -1;

/// Number of confirmed frames a spectator session buffers.
pub const SPECTATOR_FRAME_BUFFER_SIZE: usize = 64;

/// Upper bound for the input size of a single player, in bytes.
pub const MAX_INPUT_BYTES: usize = 64;

/// A frame is a single step of game execution.
///
/// Frame numbers start at 0 and increment sequentially. The special value [`NULL_FRAME`] (-1)
/// denotes "not yet started".
///
/// # Examples
///
/// ```
/// use rollback_netcode::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
///
/// let next_frame = frame + 1;
/// assert_eq!(next_frame.as_i32(), 1);
/// assert!(next_frame > frame);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame" or "not yet started".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns `Some(self)` if the frame is valid, or `None` if it's null or negative.
    #[inline]
    #[must_use]
    pub const fn to_option(self) -> Option<Frame> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0.saturating_add(rhs))
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 = self.0.saturating_add(rhs);
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0.saturating_sub(rhs))
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl std::ops::Rem<i32> for Frame {
    type Output = i32;

    #[inline]
    fn rem(self, rhs: i32) -> Self::Output {
        self.0 % rhs
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// A stable identifier for a player or spectator, valid for the lifetime of its session.
///
/// Player handles equal `player_num - 1`, so the player in slot 1 has handle 0. Spectator
/// handles start at [`SPECTATOR_HANDLE_OFFSET`].
///
/// ```
/// use rollback_netcode::{PlayerHandle, SPECTATOR_HANDLE_OFFSET};
///
/// let player = PlayerHandle::new(0);
/// let spectator = PlayerHandle::new(SPECTATOR_HANDLE_OFFSET);
/// assert!(!player.is_spectator());
/// assert!(spectator.is_spectator());
/// assert_eq!(player.player_num(), Some(1));
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Creates a new `PlayerHandle` from a `usize` value.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        PlayerHandle(handle)
    }

    /// Returns the underlying `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if this handle belongs to a spectator.
    #[inline]
    #[must_use]
    pub const fn is_spectator(self) -> bool {
        self.0 >= SPECTATOR_HANDLE_OFFSET
    }

    /// Returns `true` if this handle refers to a player slot of a session with `num_players` players.
    #[inline]
    #[must_use]
    pub const fn is_valid_player_for(self, num_players: usize) -> bool {
        self.0 < num_players
    }

    /// The 1-based player number for player handles, `None` for spectators.
    #[must_use]
    pub const fn player_num(self) -> Option<usize> {
        if self.is_spectator() {
            None
        } else {
            Some(self.0 + 1)
        }
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for PlayerHandle {
    #[inline]
    fn from(value: usize) -> Self {
        PlayerHandle(value)
    }
}

impl From<PlayerHandle> for usize {
    #[inline]
    fn from(handle: PlayerHandle) -> Self {
        handle.0
    }
}

// #############
// #   ENUMS   #
// #############

/// Defines the three kinds of participants a session knows about.
///
/// Both [`PlayerType::Remote`] and [`PlayerType::Spectator`] carry the socket address of the peer.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType {
    /// This player plays on the local device.
    #[default]
    Local,
    /// This player plays on a remote device identified by the socket address.
    Remote(SocketAddr),
    /// A remote peer that watches the game without contributing input.
    Spectator(SocketAddr),
}

/// Describes a participant to [`P2PSession::add_player`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Player {
    /// Where this participant lives.
    pub player_type: PlayerType,
    /// The 1-based player slot. Ignored for spectators.
    pub player_num: usize,
}

impl Player {
    /// A player on this device.
    #[must_use]
    pub const fn local(player_num: usize) -> Self {
        Self {
            player_type: PlayerType::Local,
            player_num,
        }
    }

    /// A player on the device at `addr`.
    #[must_use]
    pub const fn remote(player_num: usize, addr: SocketAddr) -> Self {
        Self {
            player_type: PlayerType::Remote(addr),
            player_num,
        }
    }

    /// A remote player given as an ip string and a port, e.g. `("127.0.0.1", 7000)`.
    ///
    /// # Errors
    /// Returns [`NetcodeError::InvalidRequest`] if `ip` is not a valid address.
    pub fn remote_from_ip(player_num: usize, ip: &str, port: u16) -> Result<Self, NetcodeError> {
        let ip: IpAddr = ip.parse().map_err(|_| NetcodeError::InvalidRequest {
            info: format!("'{ip}' is not a valid ip address"),
        })?;
        Ok(Self::remote(player_num, SocketAddr::new(ip, port)))
    }

    /// A spectator at `addr`.
    #[must_use]
    pub const fn spectator(addr: SocketAddr) -> Self {
        Self {
            player_type: PlayerType::Spectator(addr),
            player_num: 0,
        }
    }
}

/// A session is always in one of these states. You can query the current state via `current_state`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The session is waiting for players to be added or for endpoints to finish the handshake.
    Synchronizing,
    /// All endpoints are synchronized and the session accepts input.
    Running,
    /// [`Session::close`] was called. Every further call fails with [`NetcodeError::InvalidSession`].
    Closed,
}

/// Tells how trustworthy the input of one player in a [`SynchronizedInputs`] is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The input of this player for this frame is an actual received input.
    Confirmed,
    /// The input of this player for this frame is predicted.
    Predicted,
    /// The player has disconnected at or prior to this frame, so this input is zeroed.
    Disconnected,
}

/// Notifications delivered to [`SessionCallbacks::on_event`].
///
/// Each variant carries only the fields relevant to it; [`Event::code`] returns the numeric
/// event code of the host contract.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    /// The handshake with a peer started.
    ConnectedToPeer {
        /// The handle of the first player living on that peer.
        player: PlayerHandle,
    },
    /// The handshake made progress. After `total` roundtrips the peer is synchronized.
    SynchronizingWithPeer {
        /// The handle of the first player living on that peer.
        player: PlayerHandle,
        /// Successful roundtrips so far.
        count: u32,
        /// Required roundtrips.
        total: u32,
    },
    /// The handshake with a peer completed.
    SynchronizedWithPeer {
        /// The handle of the first player living on that peer.
        player: PlayerHandle,
    },
    /// Every peer is synchronized; the session accepts input from now on.
    Running,
    /// A peer was disconnected, either by timeout or explicitly.
    DisconnectedFromPeer {
        /// The handle of the first player living on that peer.
        player: PlayerHandle,
    },
    /// The session recommends the host to stall so slower peers can catch up.
    TimeSync {
        /// How many frames the host should skip.
        frames_ahead: u32,
    },
    /// No packets arrived from a peer for a while.
    ConnectionInterrupted {
        /// The handle of the first player living on that peer.
        player: PlayerHandle,
        /// Milliseconds left until the peer is disconnected.
        disconnect_timeout: u128,
    },
    /// Packets from a previously interrupted peer arrive again.
    ConnectionResumed {
        /// The handle of the first player living on that peer.
        player: PlayerHandle,
    },
}

impl Event {
    /// The numeric event code of the host contract.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Event::ConnectedToPeer { .. } => 1000,
            Event::SynchronizingWithPeer { .. } => 1001,
            Event::SynchronizedWithPeer { .. } => 1002,
            Event::Running => 1003,
            Event::DisconnectedFromPeer { .. } => 1004,
            Event::TimeSync { .. } => 1005,
            Event::ConnectionInterrupted { .. } => 1006,
            Event::ConnectionResumed { .. } => 1007,
        }
    }
}

// #############
// #  TRAITS   #
// #############

/// The capabilities a host application provides to a session.
///
/// The session calls these while the host is inside one of the session's operations. The
/// callbacks therefore never get access to the session itself: everything they need is passed
/// in as arguments.
pub trait SessionCallbacks {
    /// Legacy hook called once when the session starts.
    fn begin_game(&mut self, _game: &str) -> bool {
        true
    }

    /// Serializes the complete simulation state at the start of `frame`.
    fn save_game_state(&mut self, frame: Frame) -> SavedState;

    /// Restores the simulation from a buffer previously returned by [`save_game_state`].
    /// Returning `false` aborts the rollback with [`NetcodeError::GeneralFailure`].
    ///
    /// [`save_game_state`]: SessionCallbacks::save_game_state
    fn load_game_state(&mut self, buffer: &[u8]) -> bool;

    /// Dumps a saved state for diagnostics, e.g. when a sync test finds a checksum mismatch.
    fn log_game_state(&mut self, _filename: &str, _buffer: &[u8]) -> bool {
        true
    }

    /// Hands back a buffer the session no longer needs.
    fn free_buffer(&mut self, _buffer: Vec<u8>) {}

    /// Simulates exactly one frame with the given inputs. Only called while the session replays
    /// frames during a rollback.
    fn advance_frame(&mut self, inputs: &SynchronizedInputs) -> bool;

    /// Receives session notifications.
    fn on_event(&mut self, event: Event) -> bool;
}

/// This [`NonBlockingSocket`] trait is used when you want to use the sessions with your own socket.
/// Messages should be sent in an UDP-like fashion, unordered and unreliable. The peer protocol on
/// top of it makes sure all important information arrives.
pub trait NonBlockingSocket {
    /// Takes a [`Message`] and sends it to the given address.
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr);

    /// Returns all messages received since the last time this method was called, together with
    /// the address they came from.
    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)>;
}

// ###################
// # UNIT TESTS      #
// ###################
