use std::net::SocketAddr;

use tracing::{debug, info, trace};
use web_time::Duration;

use crate::frame_info::GameInput;
use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{Event as ProtocolEvent, UdpProtocol};
use crate::sessions::builder::SessionSettings;
use crate::sessions::session_trait::Session;
use crate::{
    Event, Frame, InputStatus, NetcodeError, NonBlockingSocket, PlayerHandle, SessionCallbacks,
    SessionState, SynchronizedInputs, SPECTATOR_FRAME_BUFFER_SIZE,
};

/// The host is addressed with this handle in events and [`Session::network_stats`].
const HOST_HANDLE: PlayerHandle = PlayerHandle::new(0);

/// One confirmed frame as the host streamed it, assembled player by player.
#[derive(Debug, Clone)]
struct BufferedFrame {
    frame: Frame,
    bytes: Vec<u8>,
    received: usize,
}

/// A [`SpectatorSession`] follows a [`P2PSession`](crate::P2PSession) host without contributing
/// input.
///
/// The host streams every confirmed frame; the spectator buffers up to
/// [`SPECTATOR_FRAME_BUFFER_SIZE`] of them and hands them out one by one through
/// [`Session::synchronize_input`]. Since all frames are confirmed, a spectator never rolls back.
pub struct SpectatorSession {
    num_players: usize,
    input_size: usize,
    callbacks: Box<dyn SessionCallbacks>,
    socket: Box<dyn NonBlockingSocket>,
    host: UdpProtocol,
    state: SessionState,
    buffer: Vec<BufferedFrame>,
    /// The newest frame received completely.
    last_recv_frame: Frame,
    next_frame: Frame,
    synchronized_frame: Option<Frame>,
    /// Never sent anywhere. The host endpoint requires connect status for every player.
    local_connect_status: Vec<ConnectionStatus>,
}

impl std::fmt::Debug for SpectatorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectatorSession")
            .field("host", &self.host.peer_addr())
            .field("state", &self.state)
            .field("next_frame", &self.next_frame)
            .field("last_recv_frame", &self.last_recv_frame)
            .finish_non_exhaustive()
    }
}

impl SpectatorSession {
    pub(crate) fn new(
        settings: SessionSettings,
        host_addr: SocketAddr,
        callbacks: Box<dyn SessionCallbacks>,
        socket: Box<dyn NonBlockingSocket>,
    ) -> Result<Self, NetcodeError> {
        let handles = (0..settings.num_players).map(PlayerHandle::new).collect();
        let mut host = UdpProtocol::new(
            handles,
            host_addr,
            settings.num_players,
            settings.input_size,
            0,
            settings.timing,
            settings.observer,
        );
        host.synchronize()?;

        let frame_size = settings.num_players * settings.input_size;
        let buffer = vec![
            BufferedFrame {
                frame: Frame::NULL,
                bytes: vec![0; frame_size],
                received: 0,
            };
            SPECTATOR_FRAME_BUFFER_SIZE
        ];
        Ok(Self {
            num_players: settings.num_players,
            input_size: settings.input_size,
            callbacks,
            socket,
            host,
            state: SessionState::Synchronizing,
            buffer,
            last_recv_frame: Frame::NULL,
            next_frame: Frame::new(0),
            synchronized_frame: None,
            local_connect_status: vec![ConnectionStatus::default(); settings.num_players],
        })
    }

    /// How many received frames the host application has not consumed yet. A spectator that
    /// falls behind can call `synchronize_input` and `advance_frame` several times per frame to
    /// catch up.
    #[must_use]
    pub fn frames_behind_host(&self) -> i32 {
        if self.last_recv_frame.is_null() {
            return 0;
        }
        (self.last_recv_frame - self.next_frame + 1).max(0)
    }

    /// Number of players of the watched session.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    fn ensure_open(&self) -> Result<(), NetcodeError> {
        if self.state == SessionState::Closed {
            return Err(NetcodeError::InvalidSession);
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        if self.state != SessionState::Running {
            return Err(NetcodeError::NotSynchronized);
        }
        Ok(())
    }

    fn notify(&mut self, event: Event) {
        trace!(?event, "session event");
        self.callbacks.on_event(event);
    }

    fn slot_index(frame: Frame) -> usize {
        frame.as_i32().rem_euclid(SPECTATOR_FRAME_BUFFER_SIZE as i32) as usize
    }

    fn buffer_input(&mut self, player: PlayerHandle, input: GameInput) {
        if !input.frame.is_valid() || input.bytes.len() != self.input_size {
            return;
        }
        let start = player.as_usize() * self.input_size;
        let num_players = self.num_players;
        let Some(slot) = self.buffer.get_mut(Self::slot_index(input.frame)) else {
            return;
        };
        if slot.frame != input.frame {
            slot.frame = input.frame;
            slot.received = 0;
            slot.bytes.fill(0);
        }
        if let Some(target) = slot.bytes.get_mut(start..start + input.bytes.len()) {
            target.copy_from_slice(&input.bytes);
            slot.received += 1;
        }
        if slot.received == num_players && input.frame > self.last_recv_frame {
            self.last_recv_frame = input.frame;
        }
    }

    fn poll(&mut self) {
        let host_addr = self.host.peer_addr();
        for (from, msg) in self.socket.receive_all_messages() {
            if from == host_addr {
                self.host.handle_message(&msg);
            } else {
                trace!(%from, kind = msg.kind(), "message from unknown address");
            }
        }

        let events: Vec<ProtocolEvent> = self.host.poll(&self.local_connect_status).collect();
        for event in events {
            self.handle_event(event);
        }
        self.host.send_all_messages(self.socket.as_mut());
    }

    fn handle_event(&mut self, event: ProtocolEvent) {
        let player = HOST_HANDLE;
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
                if self.state == SessionState::Synchronizing {
                    info!(host = %self.host.peer_addr(), "spectating");
                    self.state = SessionState::Running;
                    self.notify(Event::Running);
                }
            },
            ProtocolEvent::Input { input, player } => self.buffer_input(player, input),
            ProtocolEvent::Disconnected => {
                debug!(host = %self.host.peer_addr(), "host disconnected");
                self.host.disconnect();
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
}

impl Session for SpectatorSession {
    fn idle(&mut self, _timeout_ms: u64) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        self.poll();
        Ok(())
    }

    /// Spectators have no input; the call succeeds and the input is ignored.
    fn add_local_input(&mut self, _handle: PlayerHandle, _input: &[u8]) -> Result<(), NetcodeError> {
        self.ensure_open()
    }

    /// Returns the inputs of the next frame the host confirmed.
    ///
    /// # Errors
    ///
    /// - [`NetcodeError::PredictionThreshold`] if that frame has not arrived yet.
    /// - [`NetcodeError::GeneralFailure`] if the spectator fell so far behind that the frame
    ///   was overwritten in the buffer.
    fn synchronize_input(&mut self) -> Result<SynchronizedInputs, NetcodeError> {
        self.ensure_running()?;
        let next_frame = self.next_frame;
        let Some(slot) = self.buffer.get(Self::slot_index(next_frame)) else {
            return Err(NetcodeError::PredictionThreshold);
        };
        if slot.frame > next_frame {
            return Err(NetcodeError::GeneralFailure {
                context: format!(
                    "frame {next_frame} was dropped from the buffer, the host is at {}",
                    slot.frame
                ),
            });
        }
        if slot.frame < next_frame || slot.received < self.num_players {
            return Err(NetcodeError::PredictionThreshold);
        }

        let mut inputs = SynchronizedInputs::new(next_frame, self.num_players, self.input_size);
        for (i, chunk) in slot.bytes.chunks_exact(self.input_size).enumerate() {
            let status = self.host.peer_connect_status(PlayerHandle::new(i));
            if status.disconnected && status.last_frame < next_frame {
                inputs.set_player(i, &[], InputStatus::Disconnected);
            } else {
                inputs.set_player(i, chunk, InputStatus::Confirmed);
            }
        }
        self.synchronized_frame = Some(next_frame);
        Ok(inputs)
    }

    fn advance_frame(&mut self) -> Result<(), NetcodeError> {
        self.ensure_running()?;
        if self.synchronized_frame != Some(self.next_frame) {
            return Err(NetcodeError::InvalidRequest {
                info: format!("synchronize_input was not called for frame {}", self.next_frame),
            });
        }
        self.synchronized_frame = None;
        self.next_frame += 1;
        self.poll();
        Ok(())
    }

    fn network_stats(&self, handle: PlayerHandle) -> Result<NetworkStats, NetcodeError> {
        self.ensure_open()?;
        if handle != HOST_HANDLE {
            return Err(NetcodeError::InvalidPlayerHandle { handle });
        }
        Ok(self.host.network_stats())
    }

    fn set_disconnect_timeout(&mut self, timeout_ms: u64) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        self.host
            .set_disconnect_timeout(Duration::from_millis(timeout_ms));
        Ok(())
    }

    fn set_disconnect_notify_start(&mut self, notify_ms: u64) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        self.host
            .set_disconnect_notify_start(Duration::from_millis(notify_ms));
        Ok(())
    }

    fn close(&mut self) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        self.host.disconnect();
        self.state = SessionState::Closed;
        Ok(())
    }

    fn current_state(&self) -> SessionState {
        self.state
    }

    fn current_frame(&self) -> Frame {
        self.next_frame
    }
}
