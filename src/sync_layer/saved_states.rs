//! Ring of saved game states used during rollback.
//!
//! Slot `frame % capacity` holds the state for `frame`. Saving into an occupied slot evicts
//! the older state and hands its buffer back to the caller, so the host can free it.

use crate::{Frame, SavedState};

#[derive(Debug, Clone)]
struct SavedFrame {
    frame: Frame,
    state: SavedState,
}

/// Container for saved game states used during rollback.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Debug, Clone)]
pub struct SavedStates {
    slots: Vec<Option<SavedFrame>>,
}

impl SavedStates {
    /// Creates an empty ring with room for `capacity` states (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
        }
    }

    /// The number of states the ring can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The number of states currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// `true` if nothing was saved yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn index(&self, frame: Frame) -> Option<usize> {
        if !frame.is_valid() {
            return None;
        }
        Some(frame.as_i32() as usize % self.slots.len())
    }

    /// Stores `state` for `frame`. Returns the buffer of the state it replaced, if any.
    ///
    /// Returns `Err(state)` unchanged for invalid frames.
    pub fn save(&mut self, frame: Frame, state: SavedState) -> Result<Option<Vec<u8>>, SavedState> {
        let Some(index) = self.index(frame) else {
            return Err(state);
        };
        let evicted = self.slots[index].replace(SavedFrame { frame, state });
        Ok(evicted.map(|old| old.state.buffer))
    }

    /// The state saved for `frame`, if it is still in the ring.
    #[must_use]
    pub fn get(&self, frame: Frame) -> Option<&SavedState> {
        let index = self.index(frame)?;
        match &self.slots[index] {
            Some(saved) if saved.frame == frame => Some(&saved.state),
            _ => None,
        }
    }

    /// The frames currently held, oldest first.
    #[must_use]
    pub fn frames(&self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = self.slots.iter().flatten().map(|s| s.frame).collect();
        frames.sort_unstable();
        frames
    }

    /// Empties the ring and returns every buffer it held.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.slots
            .iter_mut()
            .filter_map(Option::take)
            .map(|saved| saved.state.buffer)
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn state(byte: u8) -> SavedState {
        SavedState::new(vec![byte])
    }

    #[test]
    fn test_new_ring_is_empty() {
        let ring = SavedStates::new(8);
        assert_eq!(ring.capacity(), 8);
        assert!(ring.is_empty());
        assert_eq!(SavedStates::new(0).capacity(), 1);
    }

    #[test]
    fn test_save_and_get() {
        let mut ring = SavedStates::new(8);
        assert_eq!(ring.save(Frame::new(3), state(3)).unwrap(), None);
        assert_eq!(ring.get(Frame::new(3)).unwrap().buffer, vec![3]);
        assert!(ring.get(Frame::new(4)).is_none());
        assert!(ring.get(Frame::NULL).is_none());
    }

    #[test]
    fn test_save_rejects_null_frame() {
        let mut ring = SavedStates::new(8);
        assert!(ring.save(Frame::NULL, state(1)).is_err());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_save_evicts_oldest_and_returns_its_buffer() {
        let mut ring = SavedStates::new(8);
        for frame in 0..8 {
            assert!(ring.save(Frame::new(frame), state(frame as u8)).unwrap().is_none());
        }
        assert_eq!(ring.len(), 8);
        // frame 8 lands in the slot of frame 0
        let evicted = ring.save(Frame::new(8), state(8)).unwrap();
        assert_eq!(evicted, Some(vec![0]));
        assert_eq!(ring.len(), 8);
        assert!(ring.get(Frame::new(0)).is_none());
        assert_eq!(ring.frames().first(), Some(&Frame::new(1)));
    }

    #[test]
    fn test_never_more_than_capacity() {
        let mut ring = SavedStates::new(8);
        for frame in 0..100 {
            let _ = ring.save(Frame::new(frame), state(0)).unwrap();
            assert!(ring.len() <= 8);
        }
        assert_eq!(ring.frames(), (92..100).map(Frame::new).collect::<Vec<_>>());
    }

    #[test]
    fn test_overwrite_same_frame() {
        let mut ring = SavedStates::new(8);
        let _ = ring.save(Frame::new(2), state(1)).unwrap();
        let evicted = ring.save(Frame::new(2), state(9)).unwrap();
        assert_eq!(evicted, Some(vec![1]));
        assert_eq!(ring.get(Frame::new(2)).unwrap().buffer, vec![9]);
    }

    #[test]
    fn test_drain_returns_all_buffers() {
        let mut ring = SavedStates::new(4);
        for frame in 0..3 {
            let _ = ring.save(Frame::new(frame), state(frame as u8)).unwrap();
        }
        let mut buffers = ring.drain();
        buffers.sort();
        assert_eq!(buffers, vec![vec![0], vec![1], vec![2]]);
        assert!(ring.is_empty());
    }
}
