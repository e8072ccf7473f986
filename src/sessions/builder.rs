use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;
use web_time::Duration;

use crate::input_queue::MAX_FRAME_DELAY;
use crate::network::protocol::EndpointTiming;
use crate::network::udp_socket::UdpNonBlockingSocket;
use crate::sessions::config::{ProtocolConfig, SyncConfig};
use crate::telemetry::ViolationObserver;
use crate::time_sync::TimeSyncConfig;
use crate::{
    NetcodeError, NonBlockingSocket, P2PSession, SessionCallbacks, SpectatorSession,
    SyncTestSession, MAX_INPUT_BYTES, MAX_PLAYERS, MAX_PREDICTION_FRAMES,
};

const DEFAULT_INPUT_DELAY: usize = 0;
/// Default peer disconnect timeout.
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_DISCONNECT_NOTIFY_START: Duration = Duration::from_millis(750);
/// Default frames per second for session timing.
const DEFAULT_FPS: usize = 60;
const DEFAULT_MAX_PREDICTION_FRAMES: usize = MAX_PREDICTION_FRAMES;
const DEFAULT_CHECK_DISTANCE: usize = 2;

/// Everything a session needs from the builder once it was validated.
#[derive(Clone)]
pub(crate) struct SessionSettings {
    pub num_players: usize,
    pub input_size: usize,
    pub max_prediction: usize,
    pub input_delay: usize,
    pub check_distance: usize,
    pub timing: EndpointTiming,
    pub observer: Option<Arc<dyn ViolationObserver>>,
}

/// The [`SessionBuilder`] builds all sessions.
///
/// After setting all appropriate values, use one of the `start_*` methods to consume the builder
/// and create a session of the desired type. Parameters are validated when the session starts.
///
/// ```
/// use rollback_netcode::{SessionBuilder, SyncConfig};
///
/// let builder = SessionBuilder::new(2, 4)
///     .with_local_port(7000)
///     .with_sync_config(SyncConfig::lan())
///     .with_input_delay(2)?;
/// # drop(builder);
/// # Ok::<(), rollback_netcode::NetcodeError>(())
/// ```
#[must_use = "SessionBuilder must be consumed by calling a start_*_session method"]
pub struct SessionBuilder {
    num_players: usize,
    input_size: usize,
    max_prediction: usize,
    /// The UDP port `start_udp_session` binds to.
    local_port: u16,
    /// FPS defines the expected update frequency of this session.
    fps: usize,
    input_delay: usize,
    /// The time until a remote player gets disconnected.
    disconnect_timeout: Duration,
    /// The time until the client will get a notification that a remote player is about to be disconnected.
    disconnect_notify_start: Duration,
    check_distance: usize,
    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,
    time_sync_config: TimeSyncConfig,
    /// Optional observer for internal violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            num_players,
            input_size,
            max_prediction,
            local_port,
            fps,
            input_delay,
            disconnect_timeout,
            disconnect_notify_start,
            check_distance,
            sync_config,
            protocol_config,
            time_sync_config,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("num_players", num_players)
            .field("input_size", input_size)
            .field("max_prediction", max_prediction)
            .field("local_port", local_port)
            .field("fps", fps)
            .field("input_delay", input_delay)
            .field("disconnect_timeout", disconnect_timeout)
            .field("disconnect_notify_start", disconnect_notify_start)
            .field("check_distance", check_distance)
            .field("sync_config", sync_config)
            .field("protocol_config", protocol_config)
            .field("time_sync_config", time_sync_config)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl SessionBuilder {
    /// Construct a new builder for `num_players` players sending `input_size` bytes of input per
    /// frame each. Every other parameter starts at its default.
    pub fn new(num_players: usize, input_size: usize) -> Self {
        Self {
            num_players,
            input_size,
            max_prediction: DEFAULT_MAX_PREDICTION_FRAMES,
            local_port: 0,
            fps: DEFAULT_FPS,
            input_delay: DEFAULT_INPUT_DELAY,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            disconnect_notify_start: DEFAULT_DISCONNECT_NOTIFY_START,
            check_distance: DEFAULT_CHECK_DISTANCE,
            sync_config: SyncConfig::default(),
            protocol_config: ProtocolConfig::default(),
            time_sync_config: TimeSyncConfig::default(),
            violation_observer: None,
        }
    }

    /// Change the maximum prediction window. Default is 8, which is also the upper bound.
    pub fn with_max_prediction_window(mut self, window: usize) -> Self {
        self.max_prediction = window;
        self
    }

    /// The UDP port [`start_udp_session`](Self::start_udp_session) and
    /// [`start_udp_spectator_session`](Self::start_udp_spectator_session) bind to.
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Change the amount of frames the inputs of local players are delayed. Can be overridden per
    /// session with [`Session::set_frame_delay`](crate::Session::set_frame_delay).
    ///
    /// # Errors
    ///
    /// Returns [`NetcodeError::InvalidRequest`] if `delay` exceeds the input queue capacity
    /// (127 frames).
    pub fn with_input_delay(mut self, delay: usize) -> Result<Self, NetcodeError> {
        if delay > MAX_FRAME_DELAY {
            return Err(NetcodeError::InvalidRequest {
                info: format!("frame delay {delay} exceeds the maximum of {MAX_FRAME_DELAY}"),
            });
        }
        self.input_delay = delay;
        Ok(self)
    }

    /// Sets the FPS this session is used with. This influences estimations for frame
    /// synchronization between sessions.
    ///
    /// # Errors
    /// - Returns [`NetcodeError::InvalidRequest`] if the fps is 0
    pub fn with_fps(mut self, fps: usize) -> Result<Self, NetcodeError> {
        if fps == 0 {
            return Err(NetcodeError::InvalidRequest {
                info: "fps must be higher than 0".to_owned(),
            });
        }
        self.fps = fps;
        Ok(self)
    }

    /// Sets the disconnect timeout. The session will automatically disconnect from a remote
    /// peer if it has not received a packet in the timeout window. `Duration::ZERO` disables
    /// disconnects.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Sets the time before the first notification will be sent in case of a prolonged period of
    /// no received packages.
    pub fn with_disconnect_notify_start(mut self, notify_start: Duration) -> Self {
        self.disconnect_notify_start = notify_start;
        self
    }

    /// Change the check distance of a [`SyncTestSession`]: how many frames are replayed every
    /// time a frame is verified. Default is 2.
    pub fn with_check_distance(mut self, check_distance: usize) -> Self {
        self.check_distance = check_distance;
        self
    }

    /// Sets the synchronization handshake configuration.
    pub fn with_sync_config(mut self, sync_config: SyncConfig) -> Self {
        self.sync_config = sync_config;
        self
    }

    /// Sets the protocol configuration.
    pub fn with_protocol_config(mut self, protocol_config: ProtocolConfig) -> Self {
        self.protocol_config = protocol_config;
        self
    }

    /// Sets the time synchronization configuration.
    pub fn with_time_sync_config(mut self, time_sync_config: TimeSyncConfig) -> Self {
        self.time_sync_config = time_sync_config;
        self
    }

    /// Routes internal violations to `observer` instead of only logging them.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use rollback_netcode::{CollectingObserver, SessionBuilder};
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::new(2, 1).with_violation_observer(observer.clone());
    /// # drop(builder);
    /// assert!(observer.is_empty());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Consumes the builder to construct a [`P2PSession`] on top of `socket`.
    ///
    /// Players are added to the returned session with [`Session::add_player`]; the handshake
    /// starts once every player slot is filled.
    ///
    /// # Errors
    /// - Returns [`NetcodeError::InvalidRequest`] if a parameter is out of range.
    ///
    /// [`Session::add_player`]: crate::Session::add_player
    pub fn start_p2p_session(
        self,
        callbacks: impl SessionCallbacks + 'static,
        socket: impl NonBlockingSocket + 'static,
    ) -> Result<P2PSession, NetcodeError> {
        let settings = self.settings()?;
        debug!(
            num_players = settings.num_players,
            input_size = settings.input_size,
            "starting p2p session"
        );
        Ok(P2PSession::new(settings, Box::new(callbacks), Box::new(socket)))
    }

    /// Binds a [`UdpNonBlockingSocket`] to the configured local port, calls
    /// [`SessionCallbacks::begin_game`] and starts a [`P2PSession`] on the socket.
    ///
    /// # Errors
    /// - Returns [`NetcodeError::InvalidRequest`] if no local port was set or a parameter is out of range.
    /// - Returns [`NetcodeError::Socket`] if the port cannot be bound.
    pub fn start_udp_session(
        self,
        mut callbacks: impl SessionCallbacks + 'static,
        game: &str,
    ) -> Result<P2PSession, NetcodeError> {
        let socket = self.bind_socket()?;
        begin_game(&mut callbacks, game);
        self.start_p2p_session(callbacks, socket)
    }

    /// Consumes the builder to construct a [`SyncTestSession`].
    ///
    /// # Errors
    /// - Returns [`NetcodeError::InvalidRequest`] if the check distance is not within
    ///   `1..MAX_PREDICTION_FRAMES` or another parameter is out of range.
    pub fn start_synctest_session(
        self,
        callbacks: impl SessionCallbacks + 'static,
    ) -> Result<SyncTestSession, NetcodeError> {
        let settings = self.settings()?;
        if !(1..MAX_PREDICTION_FRAMES).contains(&settings.check_distance) {
            return Err(NetcodeError::InvalidRequest {
                info: format!(
                    "check distance {} is not within 1..{}",
                    settings.check_distance, MAX_PREDICTION_FRAMES
                ),
            });
        }
        debug!(
            num_players = settings.num_players,
            check_distance = settings.check_distance,
            "starting sync test session"
        );
        Ok(SyncTestSession::new(settings, Box::new(callbacks)))
    }

    /// Consumes the builder to construct a [`SpectatorSession`] watching the host at
    /// `host_addr`. The handshake with the host starts right away.
    ///
    /// # Errors
    /// - Returns [`NetcodeError::InvalidRequest`] if a parameter is out of range.
    pub fn start_spectator_session(
        self,
        host_addr: SocketAddr,
        callbacks: impl SessionCallbacks + 'static,
        socket: impl NonBlockingSocket + 'static,
    ) -> Result<SpectatorSession, NetcodeError> {
        let settings = self.settings()?;
        debug!(host = %host_addr, "starting spectator session");
        SpectatorSession::new(settings, host_addr, Box::new(callbacks), Box::new(socket))
    }

    /// Binds a [`UdpNonBlockingSocket`] to the configured local port, calls
    /// [`SessionCallbacks::begin_game`] and starts a [`SpectatorSession`] on the socket.
    ///
    /// # Errors
    /// - Returns [`NetcodeError::InvalidRequest`] if no local port was set or a parameter is out of range.
    /// - Returns [`NetcodeError::Socket`] if the port cannot be bound.
    pub fn start_udp_spectator_session(
        self,
        host_addr: SocketAddr,
        mut callbacks: impl SessionCallbacks + 'static,
        game: &str,
    ) -> Result<SpectatorSession, NetcodeError> {
        let socket = self.bind_socket()?;
        begin_game(&mut callbacks, game);
        self.start_spectator_session(host_addr, callbacks, socket)
    }

    fn bind_socket(&self) -> Result<UdpNonBlockingSocket, NetcodeError> {
        if self.local_port == 0 {
            return Err(NetcodeError::InvalidRequest {
                info: "a udp session needs a local port".to_owned(),
            });
        }
        // parameters are checked before the port is taken
        self.validate()?;
        UdpNonBlockingSocket::bind_to_port(self.local_port).map_err(|err| NetcodeError::Socket {
            context: format!("cannot bind port {}: {err}", self.local_port),
        })
    }

    fn validate(&self) -> Result<(), NetcodeError> {
        if !(1..=MAX_PLAYERS).contains(&self.num_players) {
            return Err(NetcodeError::InvalidRequest {
                info: format!(
                    "number of players {} is not within 1..={}",
                    self.num_players, MAX_PLAYERS
                ),
            });
        }
        if !(1..=MAX_INPUT_BYTES).contains(&self.input_size) {
            return Err(NetcodeError::InvalidRequest {
                info: format!(
                    "input size {} is not within 1..={}",
                    self.input_size, MAX_INPUT_BYTES
                ),
            });
        }
        if !(1..=MAX_PREDICTION_FRAMES).contains(&self.max_prediction) {
            return Err(NetcodeError::InvalidRequest {
                info: format!(
                    "prediction window {} is not within 1..={}",
                    self.max_prediction, MAX_PREDICTION_FRAMES
                ),
            });
        }
        self.sync_config.validate()?;
        self.protocol_config.validate()?;
        Ok(())
    }

    fn settings(self) -> Result<SessionSettings, NetcodeError> {
        self.validate()?;
        Ok(SessionSettings {
            num_players: self.num_players,
            input_size: self.input_size,
            max_prediction: self.max_prediction,
            input_delay: self.input_delay,
            check_distance: self.check_distance,
            timing: EndpointTiming {
                disconnect_timeout: self.disconnect_timeout,
                disconnect_notify_start: self.disconnect_notify_start,
                fps: self.fps,
                sync: self.sync_config,
                protocol: self.protocol_config,
                time_sync: self.time_sync_config,
            },
            observer: self.violation_observer,
        })
    }
}

fn begin_game(callbacks: &mut dyn SessionCallbacks, game: &str) {
    if !callbacks.begin_game(game) {
        debug!(game, "begin_game callback returned false");
    }
}

/// Starts a [`P2PSession`] on a UDP socket bound to `local_port`.
///
/// Shorthand for [`SessionBuilder::start_udp_session`] with default parameters.
///
/// # Errors
/// See [`SessionBuilder::start_udp_session`].
pub fn start_session(
    callbacks: impl SessionCallbacks + 'static,
    game: &str,
    num_players: usize,
    input_size: usize,
    local_port: u16,
) -> Result<P2PSession, NetcodeError> {
    SessionBuilder::new(num_players, input_size)
        .with_local_port(local_port)
        .start_udp_session(callbacks, game)
}

/// Starts a [`SyncTestSession`] replaying `frames` frames on every check.
///
/// # Errors
/// See [`SessionBuilder::start_synctest_session`].
pub fn start_synctest(
    mut callbacks: impl SessionCallbacks + 'static,
    game: &str,
    num_players: usize,
    input_size: usize,
    frames: usize,
) -> Result<SyncTestSession, NetcodeError> {
    begin_game(&mut callbacks, game);
    SessionBuilder::new(num_players, input_size)
        .with_check_distance(frames)
        .start_synctest_session(callbacks)
}

/// Starts a [`SpectatorSession`] on a UDP socket bound to `local_port`, watching `host_addr`.
///
/// # Errors
/// See [`SessionBuilder::start_udp_spectator_session`].
pub fn start_spectating(
    callbacks: impl SessionCallbacks + 'static,
    game: &str,
    num_players: usize,
    input_size: usize,
    local_port: u16,
    host_addr: SocketAddr,
) -> Result<SpectatorSession, NetcodeError> {
    SessionBuilder::new(num_players, input_size)
        .with_local_port(local_port)
        .start_udp_spectator_session(host_addr, callbacks, game)
}
