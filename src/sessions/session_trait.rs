use crate::{
    Frame, NetcodeError, NetworkStats, Player, PlayerHandle, SessionState, SynchronizedInputs,
};

/// Result for operations a session type does not offer: `InvalidSession` once the session is
/// closed, `Unsupported` otherwise.
pub(crate) fn unsupported<T>(state: SessionState) -> Result<T, NetcodeError> {
    if state == SessionState::Closed {
        Err(NetcodeError::InvalidSession)
    } else {
        Err(NetcodeError::Unsupported)
    }
}

/// The host-facing operations shared by all session types.
///
/// [`P2PSession`], [`SyncTestSession`] and [`SpectatorSession`] all implement this trait, so a
/// frame loop can be written once against `dyn Session`.
///
/// | Method | [`P2PSession`] | [`SyncTestSession`] | [`SpectatorSession`] |
/// |--------|:-:|:-:|:-:|
/// | [`add_player`](Session::add_player) | yes | yes | `Unsupported` |
/// | [`set_frame_delay`](Session::set_frame_delay) | yes | `Unsupported` | `Unsupported` |
/// | [`disconnect_player`](Session::disconnect_player) | yes | `Unsupported` | `Unsupported` |
/// | [`network_stats`](Session::network_stats) | yes | `Unsupported` | yes |
/// | [`set_disconnect_timeout`](Session::set_disconnect_timeout) | yes | `Unsupported` | yes |
/// | [`set_disconnect_notify_start`](Session::set_disconnect_notify_start) | yes | `Unsupported` | yes |
///
/// ```no_run
/// use rollback_netcode::{NetcodeError, PlayerHandle, Session};
///
/// fn run_frame(session: &mut dyn Session, input: &[u8]) -> Result<(), NetcodeError> {
///     session.idle(0)?;
///     session.add_local_input(PlayerHandle::new(0), input)?;
///     let inputs = session.synchronize_input()?;
///     // simulate one frame with `inputs` ...
///     # drop(inputs);
///     session.advance_frame()
/// }
/// ```
///
/// [`P2PSession`]: crate::P2PSession
/// [`SpectatorSession`]: crate::SpectatorSession
/// [`SyncTestSession`]: crate::SyncTestSession
pub trait Session {
    /// Registers a participant and returns its handle.
    ///
    /// # Errors
    ///
    /// [`NetcodeError::PlayerOutOfRange`] for a player number outside `1..=num_players`,
    /// [`NetcodeError::TooManySpectators`] once the spectator capacity is used up.
    fn add_player(&mut self, _player: Player) -> Result<PlayerHandle, NetcodeError> {
        unsupported(self.current_state())
    }

    /// Delays the local input of `handle` by `delay` frames.
    ///
    /// # Errors
    ///
    /// [`NetcodeError::InvalidRequest`] after the first call to
    /// [`synchronize_input`](Session::synchronize_input).
    fn set_frame_delay(&mut self, _handle: PlayerHandle, _delay: usize) -> Result<(), NetcodeError> {
        unsupported(self.current_state())
    }

    /// Processes pending network traffic and timers with a single non-blocking pass.
    ///
    /// Every datagram already received is drained, timers run once and queued packets are sent.
    /// The call never sleeps or waits for packets to arrive, so it returns long before any
    /// `timeout_ms`. Hosts that want to spend spare frame time should call `idle` again.
    ///
    /// # Errors
    ///
    /// [`NetcodeError::InvalidSession`] once closed, or a rollback failure.
    fn idle(&mut self, timeout_ms: u64) -> Result<(), NetcodeError>;

    /// Adds the input of a local player for the current frame.
    ///
    /// # Errors
    ///
    /// [`NetcodeError::InvalidPlayerHandle`], [`NetcodeError::NotSynchronized`] or
    /// [`NetcodeError::InputDropped`].
    fn add_local_input(&mut self, handle: PlayerHandle, input: &[u8]) -> Result<(), NetcodeError>;

    /// Returns the inputs of every player for the current frame, predicted where needed.
    ///
    /// # Errors
    ///
    /// [`NetcodeError::PredictionThreshold`] if the host must wait for remote input.
    fn synchronize_input(&mut self) -> Result<SynchronizedInputs, NetcodeError>;

    /// Ends the current frame. Must follow [`synchronize_input`](Session::synchronize_input).
    ///
    /// # Errors
    ///
    /// [`NetcodeError::NotSynchronized`] if the session is not running.
    fn advance_frame(&mut self) -> Result<(), NetcodeError>;

    /// Disconnects a player.
    ///
    /// # Errors
    ///
    /// [`NetcodeError::PlayerDisconnected`] if the player is already disconnected.
    fn disconnect_player(&mut self, _handle: PlayerHandle) -> Result<(), NetcodeError> {
        unsupported(self.current_state())
    }

    /// The latest network statistics of a remote handle.
    ///
    /// # Errors
    ///
    /// [`NetcodeError::InvalidPlayerHandle`] for handles without an endpoint.
    fn network_stats(&self, _handle: PlayerHandle) -> Result<NetworkStats, NetcodeError> {
        unsupported(self.current_state())
    }

    /// Changes the disconnect timeout of every endpoint. `0` disables disconnects.
    ///
    /// # Errors
    ///
    /// [`NetcodeError::Unsupported`] for sessions without endpoints.
    fn set_disconnect_timeout(&mut self, _timeout_ms: u64) -> Result<(), NetcodeError> {
        unsupported(self.current_state())
    }

    /// Changes when [`Event::ConnectionInterrupted`](crate::Event::ConnectionInterrupted) fires.
    ///
    /// # Errors
    ///
    /// [`NetcodeError::Unsupported`] for sessions without endpoints.
    fn set_disconnect_notify_start(&mut self, _notify_ms: u64) -> Result<(), NetcodeError> {
        unsupported(self.current_state())
    }

    /// Releases every resource of the session. All later calls fail with
    /// [`NetcodeError::InvalidSession`].
    ///
    /// # Errors
    ///
    /// [`NetcodeError::InvalidSession`] if the session was already closed.
    fn close(&mut self) -> Result<(), NetcodeError>;

    /// The lifecycle state of the session.
    fn current_state(&self) -> SessionState;

    /// The frame the host simulates next.
    fn current_frame(&self) -> Frame;
}
