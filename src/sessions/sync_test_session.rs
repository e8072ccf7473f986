use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::frame_info::GameInput;
use crate::hash::fnv1a_checksum;
use crate::network::messages::ConnectionStatus;
use crate::sessions::builder::SessionSettings;
use crate::sessions::session_trait::Session;
use crate::sync_layer::SyncLayer;
use crate::{
    Frame, NetcodeError, Player, PlayerHandle, PlayerType, SavedState, SessionCallbacks,
    SessionState, SynchronizedInputs,
};

/// What a frame looked like when it was first simulated.
#[derive(Debug, Clone)]
struct SavedFrameInfo {
    /// The frame whose starting state `buffer` is.
    frame: Frame,
    /// The inputs that produced this state from the previous frame.
    inputs: SynchronizedInputs,
    checksum: u128,
    buffer: Vec<u8>,
}

fn checksum_of(state: &SavedState) -> u128 {
    state
        .checksum
        .unwrap_or_else(|| fnv1a_checksum(&state.buffer))
}

/// During a [`SyncTestSession`], every `check_distance` frames the session loads an older state
/// and replays the frames since then through [`SessionCallbacks::advance_frame`].
///
/// The checksum of every replayed state is compared with the checksum recorded when the frame
/// was first simulated. A difference means the host simulation is not deterministic; the session
/// then dumps both buffers through [`SessionCallbacks::log_game_state`] and fails with
/// [`NetcodeError::MismatchedChecksum`].
///
/// All players are local, so the host has to add input for every player each frame.
pub struct SyncTestSession {
    num_players: usize,
    input_size: usize,
    check_distance: usize,
    callbacks: Box<dyn SessionCallbacks>,
    sync_layer: SyncLayer,
    dummy_connect_status: Vec<ConnectionStatus>,
    state: SessionState,
    current_inputs: Vec<Option<Vec<u8>>>,
    /// The inputs handed out by `synchronize_input` for the current frame.
    synchronized: Option<SynchronizedInputs>,
    /// States simulated since `last_verified`, oldest first.
    saved_frames: VecDeque<SavedFrameInfo>,
    last_verified: Frame,
}

impl std::fmt::Debug for SyncTestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTestSession")
            .field("num_players", &self.num_players)
            .field("check_distance", &self.check_distance)
            .field("state", &self.state)
            .field("current_frame", &self.sync_layer.current_frame())
            .field("last_verified", &self.last_verified)
            .finish_non_exhaustive()
    }
}

impl SyncTestSession {
    pub(crate) fn new(settings: SessionSettings, callbacks: Box<dyn SessionCallbacks>) -> Self {
        let num_players = settings.num_players;
        let mut sync_layer = SyncLayer::new(num_players, settings.input_size)
            .with_max_prediction(settings.max_prediction)
            .with_observer(settings.observer.clone());
        for i in 0..num_players {
            // the builder bounds the delay, so this cannot fail
            if let Err(err) = sync_layer.set_frame_delay(PlayerHandle::new(i), settings.input_delay)
            {
                warn!(player = i, %err, "frame delay rejected");
            }
        }
        info!(
            num_players,
            check_distance = settings.check_distance,
            "sync test started"
        );
        Self {
            num_players,
            input_size: settings.input_size,
            check_distance: settings.check_distance,
            callbacks,
            sync_layer,
            dummy_connect_status: vec![ConnectionStatus::default(); num_players],
            state: SessionState::Running,
            current_inputs: vec![None; num_players],
            synchronized: None,
            saved_frames: VecDeque::new(),
            last_verified: Frame::new(0),
        }
    }

    /// The distance of the simulated rollbacks.
    #[must_use]
    pub fn check_distance(&self) -> usize {
        self.check_distance
    }

    /// Number of players this session was started with.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// The last frame whose replay matched the first simulation.
    #[must_use]
    pub fn last_verified_frame(&self) -> Frame {
        self.last_verified
    }

    fn ensure_open(&self) -> Result<(), NetcodeError> {
        if self.state == SessionState::Closed {
            return Err(NetcodeError::InvalidSession);
        }
        Ok(())
    }

    /// Saves the state at the start of the current frame and returns its checksum and buffer.
    fn save_and_checksum(&mut self) -> Result<(u128, Vec<u8>), NetcodeError> {
        self.sync_layer.save_current_state(self.callbacks.as_mut())?;
        let frame = self.sync_layer.current_frame();
        self.sync_layer
            .saved_state(frame)
            .map(|state| (checksum_of(state), state.buffer.clone()))
            .ok_or_else(|| NetcodeError::GeneralFailure {
                context: format!("state of frame {frame} missing right after saving it"),
            })
    }

    /// Loads the last verified state and checks every frame simulated since then.
    fn verify(&mut self) -> Result<(), NetcodeError> {
        let current_frame = self.sync_layer.current_frame();
        debug!(from = %self.last_verified, to = %current_frame, "replaying frames");
        self.sync_layer
            .load_frame(self.last_verified, self.callbacks.as_mut())?;

        while let Some(info) = self.saved_frames.pop_front() {
            if !self.callbacks.advance_frame(&info.inputs) {
                return Err(NetcodeError::GeneralFailure {
                    context: format!(
                        "advance_frame callback failed while replaying frame {}",
                        info.inputs.frame()
                    ),
                });
            }
            self.sync_layer.advance_frame();
            let (replayed, buffer) = self.save_and_checksum()?;
            if self.sync_layer.current_frame() != info.frame {
                return Err(NetcodeError::GeneralFailure {
                    context: format!(
                        "replay reached frame {} instead of {}",
                        self.sync_layer.current_frame(),
                        info.frame
                    ),
                });
            }
            if replayed != info.checksum {
                warn!(
                    frame = %info.frame,
                    original = info.checksum,
                    replayed,
                    "checksum mismatch"
                );
                self.callbacks.log_game_state(
                    &format!("synclogs/state-{}-original.log", info.frame),
                    &info.buffer,
                );
                self.callbacks
                    .log_game_state(&format!("synclogs/state-{}-replay.log", info.frame), &buffer);
                self.saved_frames.clear();
                return Err(NetcodeError::MismatchedChecksum {
                    frame: info.frame,
                    original: info.checksum,
                    replayed,
                });
            }
        }
        self.last_verified = current_frame;
        Ok(())
    }
}

impl Session for SyncTestSession {
    /// Every player of a sync test is local, so remote players are accepted like local ones.
    fn add_player(&mut self, player: Player) -> Result<PlayerHandle, NetcodeError> {
        self.ensure_open()?;
        if let PlayerType::Spectator(_) = player.player_type {
            return Err(NetcodeError::InvalidRequest {
                info: "sync tests have no spectators".to_owned(),
            });
        }
        if !(1..=self.num_players).contains(&player.player_num) {
            return Err(NetcodeError::PlayerOutOfRange {
                player_num: player.player_num,
                num_players: self.num_players,
            });
        }
        Ok(PlayerHandle::new(player.player_num - 1))
    }

    fn idle(&mut self, _timeout_ms: u64) -> Result<(), NetcodeError> {
        self.ensure_open()
    }

    /// Stores the input of `handle` for the current frame. Adding input twice before
    /// `synchronize_input` overwrites the first one.
    fn add_local_input(&mut self, handle: PlayerHandle, input: &[u8]) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        if !handle.is_valid_player_for(self.num_players) {
            return Err(NetcodeError::InvalidPlayerHandle { handle });
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
        if self.synchronized.is_some() {
            return Err(NetcodeError::InputDropped);
        }
        if let Some(slot) = self.current_inputs.get_mut(handle.as_usize()) {
            *slot = Some(input.to_vec());
        }
        Ok(())
    }

    fn synchronize_input(&mut self) -> Result<SynchronizedInputs, NetcodeError> {
        self.ensure_open()?;
        if let Some(inputs) = &self.synchronized {
            return Ok(inputs.clone());
        }
        if let Some(missing) = self.current_inputs.iter().position(Option::is_none) {
            return Err(NetcodeError::InvalidRequest {
                info: format!("player {} has no input for this frame", missing + 1),
            });
        }

        self.sync_layer.ensure_initial_save(self.callbacks.as_mut())?;
        let current_frame = self.sync_layer.current_frame();
        for (i, slot) in self.current_inputs.iter_mut().enumerate() {
            let Some(bytes) = slot.take() else {
                continue;
            };
            let handle = PlayerHandle::new(i);
            let frame = self
                .sync_layer
                .add_local_input(handle, GameInput::new(current_frame, &bytes));
            if frame.is_null() {
                return Err(NetcodeError::InputDropped);
            }
            if let Some(status) = self.dummy_connect_status.get_mut(i) {
                status.last_frame = frame;
            }
        }

        let inputs = self
            .sync_layer
            .synchronized_inputs(&self.dummy_connect_status)
            .ok_or_else(|| NetcodeError::GeneralFailure {
                context: format!("no inputs available for frame {current_frame}"),
            })?;
        self.synchronized = Some(inputs.clone());
        Ok(inputs)
    }

    fn advance_frame(&mut self) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        let Some(inputs) = self.synchronized.take() else {
            return Err(NetcodeError::InvalidRequest {
                info: format!(
                    "synchronize_input was not called for frame {}",
                    self.sync_layer.current_frame()
                ),
            });
        };

        self.sync_layer.advance_frame();
        let (checksum, buffer) = self.save_and_checksum()?;
        let current_frame = self.sync_layer.current_frame();
        self.saved_frames.push_back(SavedFrameInfo {
            frame: current_frame,
            inputs,
            checksum,
            buffer,
        });
        self.sync_layer.set_last_confirmed_frame(current_frame);

        if current_frame - self.last_verified >= self.check_distance as i32 {
            self.verify()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), NetcodeError> {
        self.ensure_open()?;
        self.sync_layer.release_states(self.callbacks.as_mut());
        self.saved_frames.clear();
        self.state = SessionState::Closed;
        Ok(())
    }

    fn current_state(&self) -> SessionState {
        self.state
    }

    fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }
}
