use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, trace};
use web_time::Duration;

use crate::frame_info::GameInput;
use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{EndpointTiming, Event as ProtocolEvent, UdpProtocol};
use crate::report_violation_to;
use crate::sessions::builder::SessionSettings;
use crate::sessions::player_registry::PlayerRegistry;
use crate::sessions::session_trait::Session;
use crate::sync_layer::SyncLayer;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    Event, Frame, NetcodeError, NonBlockingSocket, Player, PlayerHandle, PlayerType,
    SessionCallbacks, SessionState, SynchronizedInputs, MAX_SPECTATORS, SPECTATOR_HANDLE_OFFSET,
    SPECTATOR_INPUT_INTERVAL,
};

/// Minimum frames between two [`Event::TimeSync`] notifications.
const RECOMMENDATION_INTERVAL: i32 = 60;

/// A [`P2PSession`] connects to remote peers, exchanges inputs with them and rolls the host's
/// simulation back whenever a prediction turns out wrong.
///
/// Players are registered with [`Session::add_player`]. Once every player slot is filled, one
/// endpoint per remote address starts the handshake; the session reports [`Event::Running`] when
/// all endpoints (spectators included) are synchronized.
pub struct P2PSession {
    num_players: usize,
    input_size: usize,
    callbacks: Box<dyn SessionCallbacks>,
    sync_layer: SyncLayer,
    socket: Box<dyn NonBlockingSocket>,
    player_reg: PlayerRegistry,
    /// What this session knows about every player: disconnected or not, and the newest frame
    /// with real input.
    local_connect_status: Vec<ConnectionStatus>,
    state: SessionState,

    /// A player disconnected in the past; the simulation has to be replayed from this frame.
    disconnect_frame: Frame,
    /// The soonest frame on which the session can send a [`Event::TimeSync`] again.
    next_recommended_sleep: Frame,
    /// The next confirmed frame spectators receive.
    next_spectator_frame: Frame,
    /// Frame delay shared by all local players.
    local_delay: usize,
    /// `synchronize_input` succeeded at least once. Frame delays are fixed from then on.
    synchronized_once: bool,
    in_rollback: bool,
    /// The frame the last `synchronize_input` returned inputs for.
    synchronized_frame: Option<Frame>,
    /// Local inputs of the current frame, stored at the frame they apply to after the delay.
    local_inputs: BTreeMap<PlayerHandle, GameInput>,

    timing: EndpointTiming,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for P2PSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PSession")
            .field("num_players", &self.num_players)
            .field("input_size", &self.input_size)
            .field("state", &self.state)
            .field("current_frame", &self.sync_layer.current_frame())
            .field("confirmed_frame", &self.sync_layer.last_confirmed_frame())
            .field("players", &self.player_reg)
            .finish_non_exhaustive()
    }
}

impl P2PSession {
    pub(crate) fn new(
        settings: SessionSettings,
        callbacks: Box<dyn SessionCallbacks>,
        socket: Box<dyn NonBlockingSocket>,
    ) -> Self {
        let sync_layer = SyncLayer::new(settings.num_players, settings.input_size)
            .with_max_prediction(settings.max_prediction)
            .with_observer(settings.observer.clone());
        Self {
            num_players: settings.num_players,
            input_size: settings.input_size,
            callbacks,
            sync_layer,
            socket,
            player_reg: PlayerRegistry::new(),
            local_connect_status: vec![ConnectionStatus::default(); settings.num_players],
            state: SessionState::Synchronizing,
            disconnect_frame: Frame::NULL,
            next_recommended_sleep: Frame::new(0),
            next_spectator_frame: Frame::new(0),
            local_delay: settings.input_delay,
            synchronized_once: false,
            in_rollback: false,
            synchronized_frame: None,
            local_inputs: BTreeMap::new(),
            timing: settings.timing,
            observer: settings.observer,
        }
    }

    /// The newest frame for which the inputs of every connected player are known.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.sync_layer.last_confirmed_frame()
    }

    /// Number of players (local and remote) of this session.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Handles of the players on this device.
    #[must_use]
    pub fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.player_reg.local_player_handles().collect()
    }

    /// Handles of the players on remote devices.
    #[must_use]
    pub fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.player_reg.remote_player_handles().collect()
    }

    /// Number of spectators watching this session.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.player_reg.num_spectators()
    }

    /// The frame delay applied to local inputs.
    #[must_use]
    pub fn frame_delay(&self) -> usize {
        self.local_delay
    }

    fn ensure_open(&self) -> Result<(), NetcodeError> {
        if self.state == SessionState::Closed {
            return Err(NetcodeError::InvalidSession);
        }
        Ok(())
    }

    /// Checks shared by every per-frame operation.
    fn ensure_running(&self) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        if self.in_rollback {
            return Err(NetcodeError::InRollback);
        }
        if self.state != SessionState::Running {
            return Err(NetcodeError::NotSynchronized);
        }
        Ok(())
    }

    /// `true` once the session simulated as many unconfirmed frames as the ring can undo.
    fn prediction_exhausted(&self) -> bool {
        let frames_ahead =
            self.sync_layer.current_frame() - self.sync_layer.last_confirmed_frame();
        frames_ahead >= self.sync_layer.max_prediction() as i32
    }

    fn notify(&mut self, event: Event) {
        trace!(?event, "session event");
        if !self.callbacks.on_event(event) {
            trace!(code = event.code(), "on_event returned false");
        }
    }

    fn add_spectator(&mut self, addr: SocketAddr) -> Result<PlayerHandle, NetcodeError> {
        if self.state != SessionState::Synchronizing {
            return Err(NetcodeError::InvalidRequest {
                info: "spectators can only join before the session runs".to_owned(),
            });
        }
        let num_spectators = self.player_reg.num_spectators();
        if num_spectators >= MAX_SPECTATORS {
            return Err(NetcodeError::TooManySpectators);
        }
        if self.player_reg.spectators.contains_key(&addr)
            || self.player_reg.remote_handles_by_address().contains_key(&addr)
        {
            return Err(NetcodeError::InvalidRequest {
                info: format!("address {addr} is already part of the session"),
            });
        }

        let handle = PlayerHandle::new(SPECTATOR_HANDLE_OFFSET + num_spectators);
        let mut endpoint = UdpProtocol::new(
            Vec::new(),
            addr,
            self.num_players,
            self.input_size,
            self.num_players * self.input_size,
            self.timing,
            self.observer.clone(),
        );
        endpoint.synchronize()?;
        self.player_reg
            .handles
            .insert(handle, PlayerType::Spectator(addr));
        self.player_reg.spectators.insert(addr, endpoint);
        debug!(%handle, spectator = %addr, "spectator added");
        Ok(handle)
    }

    /// Creates one endpoint per remote address and starts their handshakes.
    fn create_remote_endpoints(&mut self) -> Result<(), NetcodeError> {
        let send_frame_size = self.player_reg.num_local_players() * self.input_size;
        for (addr, handles) in self.player_reg.remote_handles_by_address() {
            let mut endpoint = UdpProtocol::new(
                handles,
                addr,
                self.num_players,
                self.input_size,
                send_frame_size,
                self.timing,
                self.observer.clone(),
            );
            endpoint.synchronize()?;
            self.player_reg.remotes.insert(addr, endpoint);
        }
        debug!(
            endpoints = self.player_reg.remotes.len(),
            "all players added, synchronizing"
        );
        Ok(())
    }

    fn players_complete(&self) -> bool {
        self.player_reg.num_players() == self.num_players
    }

    /// Starts running once every player is known and every endpoint finished its handshake.
    fn check_initial_sync(&mut self) {
        if self.state != SessionState::Synchronizing
            || !self.players_complete()
            || !self.player_reg.all_synchronized()
        {
            return;
        }
        info!(
            players = self.num_players,
            spectators = self.player_reg.num_spectators(),
            "session running"
        );
        self.state = SessionState::Running;
        self.notify(Event::Running);
    }

    /// Receives all messages, runs endpoint timers and reacts to their events.
    fn poll_endpoints(&mut self) {
        for (from, msg) in self.socket.receive_all_messages() {
            if let Some(endpoint) = self.player_reg.remotes.get_mut(&from) {
                endpoint.handle_message(&msg);
            } else if let Some(endpoint) = self.player_reg.spectators.get_mut(&from) {
                endpoint.handle_message(&msg);
            } else {
                trace!(%from, kind = msg.kind(), "message from unknown address");
            }
        }

        let mut remote_events = Vec::new();
        for (addr, endpoint) in &mut self.player_reg.remotes {
            remote_events.extend(
                endpoint
                    .poll(&self.local_connect_status)
                    .map(|event| (*addr, event)),
            );
        }
        let mut spectator_events = Vec::new();
        for (addr, endpoint) in &mut self.player_reg.spectators {
            spectator_events.extend(
                endpoint
                    .poll(&self.local_connect_status)
                    .map(|event| (*addr, event)),
            );
        }

        for (addr, event) in remote_events {
            self.handle_remote_event(addr, event);
        }
        for (addr, event) in spectator_events {
            self.handle_spectator_event(addr, event);
        }
    }

    fn handle_remote_event(&mut self, addr: SocketAddr, event: ProtocolEvent) {
        let Some(player) = self
            .player_reg
            .remotes
            .get(&addr)
            .and_then(|endpoint| endpoint.handles().first().copied())
        else {
            return;
        };
        match event {
            ProtocolEvent::Connected => self.notify(Event::ConnectedToPeer { player }),
            ProtocolEvent::Synchronizing { total, count } => {
                self.notify(Event::SynchronizingWithPeer {
                    player,
                    count,
                    total,
                });
            },
            ProtocolEvent::Synchronized => {
                self.notify(Event::SynchronizedWithPeer { player });
                self.check_initial_sync();
            },
            ProtocolEvent::Input { input, player } => self.add_remote_input(player, input),
            ProtocolEvent::Disconnected => {
                self.disconnect_endpoint(addr);
                self.notify(Event::DisconnectedFromPeer { player });
            },
            ProtocolEvent::NetworkInterrupted { disconnect_timeout } => {
                self.notify(Event::ConnectionInterrupted {
                    player,
                    disconnect_timeout,
                });
            },
            ProtocolEvent::NetworkResumed => self.notify(Event::ConnectionResumed { player }),
        }
    }

    fn handle_spectator_event(&mut self, addr: SocketAddr, event: ProtocolEvent) {
        let Some(player) = self.player_reg.spectator_handle(&addr) else {
            return;
        };
        match event {
            ProtocolEvent::Synchronized => {
                self.notify(Event::SynchronizedWithPeer { player });
                self.check_initial_sync();
            },
            ProtocolEvent::Disconnected => {
                if let Some(endpoint) = self.player_reg.spectators.get_mut(&addr) {
                    endpoint.disconnect();
                }
                self.notify(Event::DisconnectedFromPeer { player });
            },
            _ => (),
        }
    }

    fn add_remote_input(&mut self, player: PlayerHandle, input: GameInput) {
        let Some(status) = self.local_connect_status.get(player.as_usize()) else {
            return;
        };
        // inputs after a disconnect are zeroed anyway
        if status.disconnected {
            return;
        }
        let frame = self.sync_layer.add_remote_input(player, input);
        match self.local_connect_status.get_mut(player.as_usize()) {
            Some(status) if frame.is_valid() => status.last_frame = frame,
            _ => trace!(%player, "remote input out of sequence"),
        }
    }

    /// Marks `handle` disconnected with real input up to `syncto`. Frames simulated with
    /// predicted input after that are replayed on the next poll.
    fn disconnect_player_queue(&mut self, handle: PlayerHandle, syncto: Frame) {
        let Some(status) = self.local_connect_status.get_mut(handle.as_usize()) else {
            return;
        };
        status.disconnected = true;
        status.last_frame = syncto;

        let replay_from = Frame::new((syncto + 1).as_i32().max(0));
        if replay_from < self.sync_layer.current_frame() {
            debug!(%handle, %syncto, "replaying frames after disconnect");
            self.disconnect_frame = if self.disconnect_frame.is_null() {
                replay_from
            } else {
                std::cmp::min(self.disconnect_frame, replay_from)
            };
        }
    }

    /// Disconnects the endpoint at `addr` and every player living there.
    fn disconnect_endpoint(&mut self, addr: SocketAddr) {
        let Some(endpoint) = self.player_reg.remotes.get_mut(&addr) else {
            return;
        };
        endpoint.disconnect();
        let handles = endpoint.handles().to_vec();
        for handle in handles {
            let Some(status) = self.local_connect_status.get(handle.as_usize()).copied() else {
                continue;
            };
            if !status.disconnected {
                self.disconnect_player_queue(handle, status.last_frame);
            }
        }
    }

    /// Loads the state of `first_incorrect` and replays up to the current frame with the inputs
    /// known now.
    fn adjust_simulation(&mut self, first_incorrect: Frame) -> Result<(), NetcodeError> {
        let current_frame = self.sync_layer.current_frame();
        if first_incorrect >= current_frame {
            // the mispredicted frame was not simulated yet
            self.sync_layer.reset_prediction();
            return Ok(());
        }

        let count = current_frame - first_incorrect;
        debug!(
            from = %first_incorrect,
            to = %current_frame,
            count,
            "rolling back"
        );
        self.in_rollback = true;
        let result = self.replay(first_incorrect, count);
        self.in_rollback = false;
        result?;

        let final_frame = self.sync_layer.current_frame();
        if final_frame != current_frame {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Error,
                ViolationKind::FrameSync,
                "current frame mismatch after resimulation: expected={}, actual={}",
                current_frame,
                final_frame
            );
        }
        Ok(())
    }

    fn replay(&mut self, frame_to_load: Frame, count: i32) -> Result<(), NetcodeError> {
        self.sync_layer
            .load_frame(frame_to_load, self.callbacks.as_mut())?;
        self.sync_layer.reset_prediction();

        for _ in 0..count {
            let inputs = self
                .sync_layer
                .synchronized_inputs(&self.local_connect_status)
                .ok_or_else(|| NetcodeError::GeneralFailure {
                    context: format!(
                        "no inputs for frame {} during resimulation",
                        self.sync_layer.current_frame()
                    ),
                })?;
            if !self.callbacks.advance_frame(&inputs) {
                return Err(NetcodeError::GeneralFailure {
                    context: format!(
                        "advance_frame callback failed while replaying frame {}",
                        inputs.frame()
                    ),
                });
            }
            self.sync_layer.advance_frame();
            self.sync_layer.save_current_state(self.callbacks.as_mut())?;
        }
        Ok(())
    }

    /// Computes the confirmation frontier and applies disconnects peers gossiped about.
    fn update_confirmed_frame(&mut self) -> Frame {
        let mut total_min_confirmed = Frame::new(i32::MAX);
        for index in 0..self.num_players {
            let handle = PlayerHandle::new(index);
            let mut queue_connected = true;
            let mut queue_min_confirmed = Frame::new(i32::MAX);

            for endpoint in self.player_reg.remotes.values() {
                if !endpoint.is_running() {
                    continue;
                }
                let status = endpoint.peer_connect_status(handle);
                queue_connected = queue_connected && !status.disconnected;
                queue_min_confirmed = std::cmp::min(queue_min_confirmed, status.last_frame);
            }

            let Some(local) = self.local_connect_status.get(index).copied() else {
                continue;
            };
            if !local.disconnected {
                queue_min_confirmed = std::cmp::min(queue_min_confirmed, local.last_frame);
            }

            if queue_connected {
                total_min_confirmed = std::cmp::min(total_min_confirmed, queue_min_confirmed);
            } else if !local.disconnected || local.last_frame > queue_min_confirmed {
                // a peer saw this player leave, possibly earlier than we did
                debug!(%handle, frame = %queue_min_confirmed, "peer reports player disconnected");
                self.disconnect_player_queue(handle, queue_min_confirmed);
            }
        }
        std::cmp::min(total_min_confirmed, self.sync_layer.current_frame())
    }

    /// Streams every confirmed frame not yet sent to the spectators.
    fn send_confirmed_inputs_to_spectators(&mut self, confirmed_frame: Frame) {
        if self.player_reg.spectators.is_empty() {
            return;
        }

        let mut queued = 0;
        while self.next_spectator_frame <= confirmed_frame {
            let inputs = match self
                .sync_layer
                .confirmed_inputs(self.next_spectator_frame, &self.local_connect_status)
            {
                Ok(inputs) => inputs,
                Err(err) => {
                    report_violation_to!(
                        self.observer,
                        ViolationSeverity::Error,
                        ViolationKind::InputQueue,
                        "no confirmed inputs for spectator frame {}: {}",
                        self.next_spectator_frame,
                        err
                    );
                    break;
                },
            };
            let input = GameInput::new(self.next_spectator_frame, inputs.as_bytes());
            for endpoint in self.player_reg.spectators.values_mut() {
                endpoint.queue_input(input.clone());
            }
            self.next_spectator_frame += 1;
            queued += 1;

            if queued % SPECTATOR_INPUT_INTERVAL == 0 {
                self.flush_spectators();
            }
        }
        if queued % SPECTATOR_INPUT_INTERVAL != 0 {
            self.flush_spectators();
        }
    }

    fn flush_spectators(&mut self) {
        for endpoint in self.player_reg.spectators.values_mut() {
            endpoint.flush_input(&self.local_connect_status);
        }
    }

    fn check_time_sync(&mut self) {
        let current_frame = self.sync_layer.current_frame();
        if current_frame <= self.next_recommended_sleep {
            return;
        }
        let frames_ahead = self
            .player_reg
            .remotes
            .values_mut()
            .filter(|endpoint| endpoint.is_running())
            .map(UdpProtocol::recommend_frames_to_skip)
            .max()
            .unwrap_or(0);
        if frames_ahead > 0 {
            debug!(frames_ahead, "recommending a stall");
            self.next_recommended_sleep = current_frame + RECOMMENDATION_INTERVAL;
            self.notify(Event::TimeSync { frames_ahead });
        }
    }

    fn send_all_messages(&mut self) {
        for endpoint in self.player_reg.remotes.values_mut() {
            endpoint.send_all_messages(self.socket.as_mut());
        }
        for endpoint in self.player_reg.spectators.values_mut() {
            endpoint.send_all_messages(self.socket.as_mut());
        }
    }

    /// The work done by `idle` and after every frame: network traffic, rollbacks, the
    /// confirmation frontier and spectator streaming.
    fn do_poll(&mut self) -> Result<(), NetcodeError> {
        self.poll_endpoints();
        self.check_initial_sync();

        if self.state == SessionState::Running && !self.in_rollback {
            let first_incorrect = self
                .sync_layer
                .check_simulation_consistency(self.disconnect_frame);
            if first_incorrect.is_valid() {
                self.adjust_simulation(first_incorrect)?;
            }
            self.disconnect_frame = Frame::NULL;

            let current_frame = self.sync_layer.current_frame();
            for endpoint in self.player_reg.remotes.values_mut() {
                if endpoint.is_running() {
                    endpoint.update_local_frame_advantage(current_frame);
                }
            }

            let confirmed_frame = self.update_confirmed_frame();
            self.send_confirmed_inputs_to_spectators(confirmed_frame);
            self.sync_layer.set_last_confirmed_frame(confirmed_frame);

            self.check_time_sync();
        }

        self.send_all_messages();
        Ok(())
    }

    /// Sends the local inputs of this frame once every local player provided one.
    fn send_local_inputs(&mut self) {
        if self.local_inputs.len() != self.player_reg.num_local_players() {
            return;
        }
        let Some(frame) = self.local_inputs.values().next().map(|input| input.frame) else {
            return;
        };
        let mut bytes = Vec::with_capacity(self.local_inputs.len() * self.input_size);
        for input in self.local_inputs.values() {
            bytes.extend_from_slice(&input.bytes);
        }
        let input = GameInput::new(frame, &bytes);
        for endpoint in self.player_reg.remotes.values_mut() {
            endpoint.send_input(input.clone(), &self.local_connect_status);
        }
    }
}

impl Session for P2PSession {
    /// Registers a local player, a remote player or a spectator.
    ///
    /// # Errors
    ///
    /// - [`NetcodeError::PlayerOutOfRange`] for a player number outside `1..=num_players`.
    /// - [`NetcodeError::InvalidRequest`] if the slot or address is already taken, or a
    ///   spectator joins a running session.
    /// - [`NetcodeError::TooManySpectators`] once [`MAX_SPECTATORS`] spectators joined.
    fn add_player(&mut self, player: Player) -> Result<PlayerHandle, NetcodeError> {
        self.ensure_open()?;
        let addr = match player.player_type {
            PlayerType::Spectator(addr) => return self.add_spectator(addr),
            PlayerType::Remote(addr) => Some(addr),
            PlayerType::Local => None,
        };

        if !(1..=self.num_players).contains(&player.player_num) {
            return Err(NetcodeError::PlayerOutOfRange {
                player_num: player.player_num,
                num_players: self.num_players,
            });
        }
        let handle = PlayerHandle::new(player.player_num - 1);
        if self.player_reg.handles.contains_key(&handle) {
            return Err(NetcodeError::InvalidRequest {
                info: format!("player {} was already added", player.player_num),
            });
        }
        if addr.is_some_and(|addr| self.player_reg.spectators.contains_key(&addr)) {
            return Err(NetcodeError::InvalidRequest {
                info: "a spectator already uses this address".to_owned(),
            });
        }

        if player.player_type == PlayerType::Local {
            self.sync_layer.set_frame_delay(handle, self.local_delay)?;
        }
        self.player_reg.handles.insert(handle, player.player_type);
        debug!(%handle, player_type = ?player.player_type, "player added");

        if self.players_complete() {
            self.create_remote_endpoints()?;
        }
        Ok(handle)
    }

    /// Sets the input delay of the local players. All local players share one delay, so
    /// setting it for one local handle sets it for all of them.
    fn set_frame_delay(&mut self, handle: PlayerHandle, delay: usize) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        if self.player_reg.player_type(handle) != Some(PlayerType::Local) {
            return Err(NetcodeError::InvalidPlayerHandle { handle });
        }
        if self.synchronized_once {
            return Err(NetcodeError::InvalidRequest {
                info: "the frame delay cannot change after the first synchronize_input".to_owned(),
            });
        }
        let local_handles: Vec<PlayerHandle> = self.player_reg.local_player_handles().collect();
        for local in local_handles {
            self.sync_layer.set_frame_delay(local, delay)?;
        }
        self.local_delay = delay;
        Ok(())
    }

    /// One pass of [`Self::do_poll`]. `timeout_ms` is only an upper bound, the pass never waits.
    fn idle(&mut self, _timeout_ms: u64) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        self.do_poll()
    }

    fn add_local_input(&mut self, handle: PlayerHandle, input: &[u8]) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        if self.in_rollback {
            return Err(NetcodeError::InRollback);
        }
        if self.player_reg.player_type(handle) != Some(PlayerType::Local) {
            return Err(NetcodeError::InvalidPlayerHandle { handle });
        }
        if self.state != SessionState::Running {
            return Err(NetcodeError::NotSynchronized);
        }
        if input.len() != self.input_size {
            return Err(NetcodeError::InvalidRequest {
                info: format!(
                    "input has {} bytes, the session expects {}",
                    input.len(),
                    self.input_size
                ),
            });
        }
        if self.prediction_exhausted() || self.local_inputs.contains_key(&handle) {
            return Err(NetcodeError::InputDropped);
        }

        let current_frame = self.sync_layer.current_frame();
        let actual_frame = self
            .sync_layer
            .add_local_input(handle, GameInput::new(current_frame, input));
        if actual_frame.is_null() {
            return Err(NetcodeError::InputDropped);
        }
        if let Some(status) = self.local_connect_status.get_mut(handle.as_usize()) {
            status.last_frame = actual_frame;
        }
        self.local_inputs
            .insert(handle, GameInput::new(actual_frame, input));
        self.send_local_inputs();
        Ok(())
    }

    fn synchronize_input(&mut self) -> Result<SynchronizedInputs, NetcodeError> {
        self.ensure_running()?;
        if self.prediction_exhausted() {
            return Err(NetcodeError::PredictionThreshold);
        }
        if let Some(missing) = self
            .player_reg
            .local_player_handles()
            .find(|handle| !self.local_inputs.contains_key(handle))
        {
            return Err(NetcodeError::InvalidRequest {
                info: format!("local player {missing} has no input for this frame"),
            });
        }

        self.sync_layer.ensure_initial_save(self.callbacks.as_mut())?;
        let inputs = self
            .sync_layer
            .synchronized_inputs(&self.local_connect_status)
            .ok_or_else(|| NetcodeError::GeneralFailure {
                context: format!(
                    "no inputs available for frame {}",
                    self.sync_layer.current_frame()
                ),
            })?;
        self.synchronized_once = true;
        self.synchronized_frame = Some(inputs.frame());
        Ok(inputs)
    }

    fn advance_frame(&mut self) -> Result<(), NetcodeError> {
        self.ensure_running()?;
        let current_frame = self.sync_layer.current_frame();
        if self.synchronized_frame != Some(current_frame) {
            return Err(NetcodeError::InvalidRequest {
                info: format!("synchronize_input was not called for frame {current_frame}"),
            });
        }
        self.synchronized_frame = None;
        self.local_inputs.clear();

        self.sync_layer.advance_frame();
        self.sync_layer.save_current_state(self.callbacks.as_mut())?;
        self.do_poll()
    }

    /// Disconnects a player.
    ///
    /// A remote handle disconnects its endpoint and every player living there at the last
    /// frame received from them. A local handle disconnects every remote player at the current
    /// frame. A spectator handle disconnects that spectator.
    fn disconnect_player(&mut self, handle: PlayerHandle) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        match self.player_reg.player_type(handle) {
            None => Err(NetcodeError::InvalidPlayerHandle { handle }),
            Some(PlayerType::Remote(addr)) => {
                let disconnected = self
                    .local_connect_status
                    .get(handle.as_usize())
                    .is_none_or(|status| status.disconnected);
                if disconnected {
                    return Err(NetcodeError::PlayerDisconnected { handle });
                }
                self.disconnect_endpoint(addr);
                Ok(())
            },
            Some(PlayerType::Local) => {
                let remotes: Vec<PlayerHandle> = self
                    .player_reg
                    .remote_player_handles()
                    .filter(|remote| {
                        self.local_connect_status
                            .get(remote.as_usize())
                            .is_some_and(|status| !status.disconnected)
                    })
                    .collect();
                if remotes.is_empty() {
                    return Err(NetcodeError::PlayerDisconnected { handle });
                }
                let current_frame = self.sync_layer.current_frame();
                for remote in remotes {
                    if let Some(addr) = self.player_reg.address_of(remote) {
                        if let Some(endpoint) = self.player_reg.remotes.get_mut(&addr) {
                            endpoint.disconnect();
                        }
                    }
                    self.disconnect_player_queue(remote, current_frame);
                }
                Ok(())
            },
            Some(PlayerType::Spectator(addr)) => {
                let endpoint = self
                    .player_reg
                    .spectators
                    .get_mut(&addr)
                    .ok_or(NetcodeError::InvalidPlayerHandle { handle })?;
                if !endpoint.is_running() {
                    return Err(NetcodeError::PlayerDisconnected { handle });
                }
                endpoint.disconnect();
                Ok(())
            },
        }
    }

    fn network_stats(&self, handle: PlayerHandle) -> Result<NetworkStats, NetcodeError> {
        self.ensure_open()?;
        match self.player_reg.player_type(handle) {
            Some(PlayerType::Remote(addr)) => self
                .player_reg
                .remotes
                .get(&addr)
                .map(UdpProtocol::network_stats)
                .ok_or(NetcodeError::InvalidPlayerHandle { handle }),
            _ => Err(NetcodeError::InvalidPlayerHandle { handle }),
        }
    }

    fn set_disconnect_timeout(&mut self, timeout_ms: u64) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        let timeout = Duration::from_millis(timeout_ms);
        self.timing.disconnect_timeout = timeout;
        for endpoint in self
            .player_reg
            .remotes
            .values_mut()
            .chain(self.player_reg.spectators.values_mut())
        {
            endpoint.set_disconnect_timeout(timeout);
        }
        Ok(())
    }

    fn set_disconnect_notify_start(&mut self, notify_ms: u64) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        let notify_start = Duration::from_millis(notify_ms);
        self.timing.disconnect_notify_start = notify_start;
        for endpoint in self
            .player_reg
            .remotes
            .values_mut()
            .chain(self.player_reg.spectators.values_mut())
        {
            endpoint.set_disconnect_notify_start(notify_start);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        self.sync_layer.release_states(self.callbacks.as_mut());
        self.player_reg.remotes.clear();
        self.player_reg.spectators.clear();
        self.local_inputs.clear();
        self.state = SessionState::Closed;
        info!("session closed");
        Ok(())
    }

    fn current_state(&self) -> SessionState {
        self.state
    }

    fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }
}
