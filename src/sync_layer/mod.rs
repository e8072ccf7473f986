//! # Sync Layer
//!
//! The sync layer owns the per-player [`InputQueue`]s, the ring of [`SavedStates`] and the frame
//! counters of a session. Sessions drive it; the host's simulation is reached through
//! [`SessionCallbacks`].
//!
//! ## How Rollback Works
//!
//! 1. Every time the session advances, the state at the start of the new frame is saved through
//!    [`SessionCallbacks::save_game_state`] into slot `frame % 8` of the ring.
//! 2. Remote inputs that have not arrived are predicted by repeating the last known input.
//! 3. When the real input for a predicted frame arrives and differs, the input queue remembers the
//!    first incorrect frame. The session loads the state saved for that frame, resets all
//!    predictions and replays every frame up to the present through
//!    [`SessionCallbacks::advance_frame`], saving each replayed frame again.
//! 4. Frames at or before the confirmation frontier are never replayed: the prediction threshold
//!    keeps the session within 8 frames of it, so the ring always holds the state needed.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Game Loop (per frame)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  1. Add local inputs    ──►  InputQueue (local player)      │
//! │  2. Receive network     ──►  InputQueue (remote players)    │
//! │  3. Check for rollback  ──►  If misprediction detected:     │
//! │                              └─► load_game_state callback   │
//! │                              └─► replay via advance_frame   │
//! │  4. Get synchronized    ──►  All players' inputs for frame  │
//! │     inputs                                                   │
//! │  5. Advance & save      ──►  SavedStates ring               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod saved_states;

pub use saved_states::SavedStates;

use std::sync::Arc;

use tracing::debug;

use crate::frame_info::GameInput;
use crate::input_queue::InputQueue;
use crate::network::messages::ConnectionStatus;
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    Frame, InputStatus, NetcodeError, PlayerHandle, SavedState, SessionCallbacks,
    SynchronizedInputs, MAX_PREDICTION_FRAMES,
};

/// The synchronization layer manages game state, input queues, and rollback operations.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
pub struct SyncLayer {
    num_players: usize,
    input_size: usize,
    /// Maximum frames of prediction allowed before rollback is required.
    max_prediction: usize,
    saved_states: SavedStates,
    /// The last frame where all player inputs are confirmed.
    last_confirmed_frame: Frame,
    /// The most recently saved frame.
    last_saved_frame: Frame,
    /// The current simulation frame.
    current_frame: Frame,
    input_queues: Vec<InputQueue>,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SyncLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLayer")
            .field("num_players", &self.num_players)
            .field("input_size", &self.input_size)
            .field("max_prediction", &self.max_prediction)
            .field("current_frame", &self.current_frame)
            .field("last_confirmed_frame", &self.last_confirmed_frame)
            .field("last_saved_frame", &self.last_saved_frame)
            .field("saved_states", &self.saved_states)
            .finish_non_exhaustive()
    }
}

impl SyncLayer {
    /// Creates a sync layer for `num_players` players with `input_size` byte inputs.
    #[must_use]
    pub fn new(num_players: usize, input_size: usize) -> Self {
        Self {
            num_players,
            input_size,
            max_prediction: MAX_PREDICTION_FRAMES,
            last_confirmed_frame: Frame::NULL,
            last_saved_frame: Frame::NULL,
            current_frame: Frame::new(0),
            saved_states: SavedStates::new(MAX_PREDICTION_FRAMES),
            input_queues: (0..num_players).map(|_| InputQueue::new(input_size)).collect(),
            observer: None,
        }
    }

    /// Reports invariant violations of the layer and its input queues to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Option<Arc<dyn ViolationObserver>>) -> Self {
        self.input_queues = self
            .input_queues
            .into_iter()
            .map(|queue| queue.with_observer(observer.clone()))
            .collect();
        self.observer = observer;
        self
    }

    /// Narrows the prediction window. The save ring keeps its capacity of
    /// [`MAX_PREDICTION_FRAMES`], so larger values are clamped.
    #[must_use]
    pub fn with_max_prediction(mut self, max_prediction: usize) -> Self {
        self.max_prediction = max_prediction.clamp(1, MAX_PREDICTION_FRAMES);
        self
    }

    /// Number of players.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Size of a single player's input.
    #[must_use]
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// The prediction window.
    #[must_use]
    pub fn max_prediction(&self) -> usize {
        self.max_prediction
    }

    /// Returns the current simulation frame.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// Advances the simulation by one frame.
    pub fn advance_frame(&mut self) {
        self.current_frame += 1;
    }

    /// Returns the latest saved frame.
    #[must_use]
    pub fn last_saved_frame(&self) -> Frame {
        self.last_saved_frame
    }

    /// Returns the latest confirmed frame.
    #[must_use]
    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    /// Saves the state of the current frame through the host callback.
    ///
    /// A state evicted from the ring is handed back through [`SessionCallbacks::free_buffer`].
    ///
    /// # Errors
    /// Returns [`NetcodeError::GeneralFailure`] if the current frame cannot be stored.
    pub fn save_current_state(
        &mut self,
        callbacks: &mut dyn SessionCallbacks,
    ) -> Result<(), NetcodeError> {
        let state = callbacks.save_game_state(self.current_frame);
        match self.saved_states.save(self.current_frame, state) {
            Ok(evicted) => {
                if let Some(buffer) = evicted {
                    callbacks.free_buffer(buffer);
                }
                self.last_saved_frame = self.current_frame;
                Ok(())
            },
            Err(state) => {
                callbacks.free_buffer(state.buffer);
                Err(NetcodeError::GeneralFailure {
                    context: format!("cannot save state for frame {}", self.current_frame),
                })
            },
        }
    }

    /// Saves the state of the current frame if nothing was saved yet.
    pub(crate) fn ensure_initial_save(
        &mut self,
        callbacks: &mut dyn SessionCallbacks,
    ) -> Result<(), NetcodeError> {
        if self.last_saved_frame.is_null() {
            self.save_current_state(callbacks)?;
        }
        Ok(())
    }

    /// The state saved for `frame`, if it is still in the ring.
    #[must_use]
    pub fn saved_state(&self, frame: Frame) -> Option<&SavedState> {
        self.saved_states.get(frame)
    }

    /// The frames currently held in the ring, oldest first.
    #[must_use]
    pub fn saved_frames(&self) -> Vec<Frame> {
        self.saved_states.frames()
    }

    /// Loads the state saved for `frame_to_load` and makes it the current frame.
    ///
    /// # Errors
    /// Returns [`NetcodeError::GeneralFailure`] if `frame_to_load` is not in the past, is no longer
    /// in the ring, or the host fails to restore it.
    pub fn load_frame(
        &mut self,
        frame_to_load: Frame,
        callbacks: &mut dyn SessionCallbacks,
    ) -> Result<(), NetcodeError> {
        if frame_to_load.is_null() || frame_to_load > self.current_frame {
            return Err(NetcodeError::GeneralFailure {
                context: format!(
                    "cannot load frame {} while at frame {}",
                    frame_to_load, self.current_frame
                ),
            });
        }
        let Some(state) = self.saved_states.get(frame_to_load) else {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Critical,
                ViolationKind::StateManagement,
                "No saved state for frame {} (current frame {})",
                frame_to_load,
                self.current_frame
            );
            return Err(NetcodeError::GeneralFailure {
                context: format!("no saved state for frame {}", frame_to_load),
            });
        };
        if !callbacks.load_game_state(&state.buffer) {
            return Err(NetcodeError::GeneralFailure {
                context: format!("host failed to load the state of frame {}", frame_to_load),
            });
        }
        self.current_frame = frame_to_load;
        self.last_saved_frame = frame_to_load;
        Ok(())
    }

    /// Hands every saved buffer back through [`SessionCallbacks::free_buffer`].
    pub(crate) fn release_states(&mut self, callbacks: &mut dyn SessionCallbacks) {
        for buffer in self.saved_states.drain() {
            callbacks.free_buffer(buffer);
        }
        self.last_saved_frame = Frame::NULL;
    }

    /// Sets the frame delay for a player.
    ///
    /// # Errors
    /// Returns `NetcodeError::InvalidPlayerHandle` if `player_handle >= num_players`.
    /// Returns `NetcodeError::InvalidRequest` if `delay` exceeds the maximum allowed value.
    pub fn set_frame_delay(
        &mut self,
        player_handle: PlayerHandle,
        delay: usize,
    ) -> Result<(), NetcodeError> {
        self.input_queues
            .get_mut(player_handle.as_usize())
            .ok_or(NetcodeError::InvalidPlayerHandle {
                handle: player_handle,
            })?
            .set_frame_delay(delay)
    }

    /// Frame delay of a player, 0 for unknown handles.
    #[must_use]
    pub fn frame_delay(&self, player_handle: PlayerHandle) -> usize {
        self.input_queues
            .get(player_handle.as_usize())
            .map_or(0, InputQueue::frame_delay)
    }

    /// The newest frame that holds real input for a player.
    #[must_use]
    pub fn last_added_frame(&self, player_handle: PlayerHandle) -> Frame {
        self.input_queues
            .get(player_handle.as_usize())
            .map_or(Frame::NULL, InputQueue::last_added_frame)
    }

    /// Resets the prediction state for all input queues.
    pub fn reset_prediction(&mut self) {
        for queue in &mut self.input_queues {
            queue.reset_prediction();
        }
    }

    /// Adds local input for the current frame. Returns the frame the input is actually stored at,
    /// which differs from the current frame by the player's frame delay.
    ///
    /// Returns `Frame::NULL` if the input frame doesn't match the current frame.
    pub(crate) fn add_local_input(&mut self, player_handle: PlayerHandle, input: GameInput) -> Frame {
        if input.frame != self.current_frame {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Error,
                ViolationKind::FrameSync,
                "Input frame {} doesn't match current frame {}",
                input.frame,
                self.current_frame
            );
            return Frame::NULL;
        }
        self.input_queues
            .get_mut(player_handle.as_usize())
            .map_or(Frame::NULL, |queue| queue.add_input(input))
    }

    /// Adds remote input to the corresponding input queue.
    /// Remote inputs already had their delay applied by the peer that produced them.
    pub(crate) fn add_remote_input(&mut self, player_handle: PlayerHandle, input: GameInput) -> Frame {
        let Some(queue) = self.input_queues.get_mut(player_handle.as_usize()) else {
            return Frame::NULL;
        };
        match queue.confirm(input) {
            Some((frame, true)) => {
                debug!(player = %player_handle, %frame, "remote input contradicts the prediction");
                frame
            },
            Some((frame, false)) => frame,
            None => Frame::NULL,
        }
    }

    /// Returns inputs for all players for the current frame, predicting where needed.
    /// Players disconnected before the current frame get zeroed input.
    ///
    /// # Returns
    /// Returns `None` if any input queue operation fails (indicates a severe internal error).
    pub(crate) fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> Option<SynchronizedInputs> {
        let mut inputs = SynchronizedInputs::new(self.current_frame, self.num_players, self.input_size);
        for (i, queue) in self.input_queues.iter_mut().enumerate() {
            let disconnected = connect_status
                .get(i)
                .is_some_and(|s| s.disconnected && s.last_frame < self.current_frame);
            if disconnected {
                inputs.set_player(i, &[], InputStatus::Disconnected);
            } else {
                let (input, status) = queue.input(self.current_frame)?;
                inputs.set_player(i, &input.bytes, status);
            }
        }
        Some(inputs)
    }

    /// Returns the confirmed inputs of all players for `frame`.
    ///
    /// # Errors
    /// Returns `NetcodeError::InvalidRequest` if some player's input for `frame` is not confirmed.
    pub(crate) fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Result<SynchronizedInputs, NetcodeError> {
        let mut inputs = SynchronizedInputs::new(frame, self.num_players, self.input_size);
        for (i, queue) in self.input_queues.iter().enumerate() {
            let disconnected = connect_status
                .get(i)
                .is_some_and(|s| s.disconnected && s.last_frame < frame);
            if disconnected {
                inputs.set_player(i, &[], InputStatus::Disconnected);
            } else {
                let input = queue.confirmed_input(frame)?;
                inputs.set_player(i, &input.bytes, InputStatus::Confirmed);
            }
        }
        Ok(inputs)
    }

    /// Raises the confirmation frontier. Inputs older than it are no longer needed and discarded.
    pub(crate) fn set_last_confirmed_frame(&mut self, mut frame: Frame) {
        // never confirm past a misprediction that still has to be replayed
        let first_incorrect = self.check_simulation_consistency(Frame::NULL);
        frame = std::cmp::min(frame, self.current_frame);
        if !first_incorrect.is_null() && first_incorrect < frame {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "Clamping confirmed frame {} to first_incorrect {}",
                frame,
                first_incorrect
            );
            frame = first_incorrect;
        }

        self.last_confirmed_frame = frame;
        if self.last_confirmed_frame.as_i32() > 0 {
            for queue in &mut self.input_queues {
                queue.discard_confirmed_frames(frame - 1);
            }
        }
    }

    /// Finds the earliest incorrect frame detected by the individual input queues.
    pub(crate) fn check_simulation_consistency(&self, mut first_incorrect: Frame) -> Frame {
        for queue in &self.input_queues {
            let incorrect = queue.first_incorrect_frame();
            if !incorrect.is_null() && (first_incorrect.is_null() || incorrect < first_incorrect) {
                first_incorrect = incorrect;
            }
        }
        first_incorrect
    }
}

// #########
// # TESTS #
// #########
