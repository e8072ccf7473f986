use smallvec::SmallVec;

use crate::{Frame, InputStatus, NetcodeError};

/// Inline capacity of [`GameInput`] payloads. Larger inputs spill to the heap.
pub(crate) const INLINE_INPUT_BYTES: usize = 16;

/// The input of a single player for a single frame. The associated frame is denoted with `frame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInput {
    /// The frame to which this input belongs. [`Frame::NULL`] marks an unused slot.
    pub frame: Frame,
    /// The raw input payload, always exactly the session's input size.
    pub bytes: SmallVec<[u8; INLINE_INPUT_BYTES]>,
}

impl GameInput {
    /// Creates a new `GameInput` for `frame` holding a copy of `bytes`.
    #[must_use]
    pub fn new(frame: Frame, bytes: &[u8]) -> Self {
        Self {
            frame,
            bytes: SmallVec::from_slice(bytes),
        }
    }

    /// Creates an all-zero input of `size` bytes.
    #[must_use]
    pub fn blank(frame: Frame, size: usize) -> Self {
        Self {
            frame,
            bytes: SmallVec::from_elem(0, size),
        }
    }

    /// Number of payload bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn equal(&self, other: &Self, bits_only: bool) -> bool {
        (bits_only || self.frame == other.frame) && self.bytes == other.bytes
    }
}

/// A snapshot produced by [`SessionCallbacks::save_game_state`].
///
/// The `checksum` is optional. Sync tests compare checksums of replayed frames and fall back to
/// hashing the buffer when none is given.
///
/// [`SessionCallbacks::save_game_state`]: crate::SessionCallbacks::save_game_state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedState {
    /// The serialized simulation.
    pub buffer: Vec<u8>,
    /// Optional checksum of the simulation.
    pub checksum: Option<u128>,
}

impl SavedState {
    /// A snapshot without checksum.
    #[must_use]
    pub fn new(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            checksum: None,
        }
    }

    /// A snapshot with checksum.
    #[must_use]
    pub fn with_checksum(buffer: Vec<u8>, checksum: u128) -> Self {
        Self {
            buffer,
            checksum: Some(checksum),
        }
    }

    /// Length of the serialized simulation in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// `true` if the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// The inputs of all players for one frame, as returned by `synchronize_input` and passed to
/// [`SessionCallbacks::advance_frame`] during replays.
///
/// Player `i` (handle `i`, player number `i + 1`) occupies bytes `i * input_size..(i + 1) * input_size`.
/// Disconnected players are zeroed and have their bit set in [`disconnect_flags`].
///
/// [`SessionCallbacks::advance_frame`]: crate::SessionCallbacks::advance_frame
/// [`disconnect_flags`]: SynchronizedInputs::disconnect_flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchronizedInputs {
    frame: Frame,
    input_size: usize,
    bytes: Vec<u8>,
    statuses: Vec<InputStatus>,
    disconnect_flags: u32,
}

impl SynchronizedInputs {
    pub(crate) fn new(frame: Frame, num_players: usize, input_size: usize) -> Self {
        Self {
            frame,
            input_size,
            bytes: vec![0; num_players * input_size],
            statuses: vec![InputStatus::Confirmed; num_players],
            disconnect_flags: 0,
        }
    }

    pub(crate) fn set_player(&mut self, index: usize, bytes: &[u8], status: InputStatus) {
        let start = index * self.input_size;
        if let Some(slot) = self.bytes.get_mut(start..start + self.input_size) {
            if status == InputStatus::Disconnected {
                slot.fill(0);
                self.disconnect_flags |= 1 << index;
            } else {
                let len = bytes.len().min(slot.len());
                slot[..len].copy_from_slice(&bytes[..len]);
            }
        }
        if let Some(entry) = self.statuses.get_mut(index) {
            *entry = status;
        }
    }

    /// The frame these inputs belong to.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Number of players.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.statuses.len()
    }

    /// Size of a single player's input.
    #[must_use]
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// The input of player `index`, or `None` if out of range.
    #[must_use]
    pub fn player(&self, index: usize) -> Option<&[u8]> {
        let start = index * self.input_size;
        self.bytes.get(start..start + self.input_size)
    }

    /// The status of player `index`'s input.
    #[must_use]
    pub fn status(&self, index: usize) -> Option<InputStatus> {
        self.statuses.get(index).copied()
    }

    /// `true` if player `index` is disconnected at this frame.
    #[must_use]
    pub fn is_disconnected(&self, index: usize) -> bool {
        index < 32 && self.disconnect_flags & (1 << index) != 0
    }

    /// Bit `i` is set if player `i` is disconnected.
    #[must_use]
    pub fn disconnect_flags(&self) -> u32 {
        self.disconnect_flags
    }

    /// All inputs concatenated in player order.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copies the concatenated inputs into `out` and returns the disconnect flags.
    ///
    /// # Errors
    /// Returns [`NetcodeError::InvalidRequest`] if `out` is smaller than `num_players * input_size`.
    pub fn copy_into(&self, out: &mut [u8]) -> Result<u32, NetcodeError> {
        let Some(target) = out.get_mut(..self.bytes.len()) else {
            return Err(NetcodeError::InvalidRequest {
                info: format!(
                    "buffer of {} bytes cannot hold {} bytes of input",
                    out.len(),
                    self.bytes.len()
                ),
            });
        };
        target.copy_from_slice(&self.bytes);
        Ok(self.disconnect_flags)
    }
}

// #########
// # TESTS #
// #########
