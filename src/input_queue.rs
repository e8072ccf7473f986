use crate::frame_info::GameInput;
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Frame, InputStatus, NetcodeError};
use std::cmp;
use std::sync::Arc;

/// The length of the input queue. This describes the number of inputs the session can hold at the
/// same time per player.
///
/// # Note
///
/// This constant is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
pub const INPUT_QUEUE_LENGTH: usize = 128;

/// The maximum allowed frame delay. Must be less than [`INPUT_QUEUE_LENGTH`] to ensure
/// the circular buffer doesn't overflow when advancing the queue head.
pub const MAX_FRAME_DELAY: usize = INPUT_QUEUE_LENGTH - 1;

/// `InputQueue` stores the inputs of a single player in a ring buffer indexed by frame.
///
/// - Inputs are added strictly sequentially. Frame delay gaps are filled with the previous input.
/// - Requests for frames that are not in the queue yet return a prediction: the last input that
///   was added, repeated. The prediction stays frozen until real input replaces it.
/// - When real input for a predicted frame arrives and differs from the prediction, the queue
///   remembers it in [`first_incorrect_frame`](InputQueue::first_incorrect_frame).
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Clone)]
pub struct InputQueue {
    /// The head of the queue. The newest input is saved here
    head: usize,
    /// The tail of the queue. The oldest input still valid is saved here.
    tail: usize,
    /// The current length of the queue.
    length: usize,
    /// Denotes if we still are in the first frame, an edge case to be considered by some methods.
    first_frame: bool,

    /// The last frame added by the user
    last_added_frame: Frame,
    /// The first frame in the queue that is known to be an incorrect prediction
    first_incorrect_frame: Frame,
    /// The last frame that has been requested. Nothing after it is ever discarded.
    last_requested_frame: Frame,

    /// The delay in frames by which inputs are sent back to the user.
    frame_delay: usize,

    /// Size of each input payload in bytes.
    input_size: usize,

    /// Our cyclic input queue
    inputs: Vec<GameInput>,
    /// The prediction handed out for frames that have no real input yet.
    prediction: GameInput,

    observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for InputQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputQueue")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("length", &self.length)
            .field("last_added_frame", &self.last_added_frame)
            .field("first_incorrect_frame", &self.first_incorrect_frame)
            .field("frame_delay", &self.frame_delay)
            .field("prediction", &self.prediction)
            .finish_non_exhaustive()
    }
}

impl InputQueue {
    /// Creates an empty queue for payloads of `input_size` bytes.
    #[must_use]
    pub fn new(input_size: usize) -> Self {
        Self {
            head: 0,
            tail: 0,
            length: 0,
            frame_delay: 0,
            first_frame: true,
            last_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_requested_frame: Frame::NULL,
            prediction: GameInput::blank(Frame::NULL, input_size),
            inputs: vec![GameInput::blank(Frame::NULL, input_size); INPUT_QUEUE_LENGTH],
            input_size,
            observer: None,
        }
    }

    /// Reports invariant violations to `observer` instead of the tracing default.
    #[must_use]
    pub fn with_observer(mut self, observer: Option<Arc<dyn ViolationObserver>>) -> Self {
        self.observer = observer;
        self
    }

    /// Size of each input payload in bytes.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Number of inputs currently held.
    pub fn len(&self) -> usize {
        self.length
    }

    /// `true` if no input was added yet (or everything was discarded).
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The frame of the newest real input, [`Frame::NULL`] if there is none.
    pub fn last_added_frame(&self) -> Frame {
        self.last_added_frame
    }

    /// Returns the first frame in the queue that is known to be an incorrect prediction.
    pub fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    /// The configured frame delay.
    pub fn frame_delay(&self) -> usize {
        self.frame_delay
    }

    /// Sets the frame delay for this input queue.
    ///
    /// # Errors
    /// Returns `NetcodeError::InvalidRequest` if `delay > MAX_FRAME_DELAY`.
    pub fn set_frame_delay(&mut self, delay: usize) -> Result<(), NetcodeError> {
        if delay > MAX_FRAME_DELAY {
            return Err(NetcodeError::InvalidRequest {
                info: format!(
                    "Frame delay {} exceeds maximum allowed value of {}.",
                    delay, MAX_FRAME_DELAY
                ),
            });
        }
        self.frame_delay = delay;
        Ok(())
    }

    /// Resets the prediction state.
    pub fn reset_prediction(&mut self) {
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Returns the input for `requested_frame` only if it is a real input.
    /// In contrast to [`input`](InputQueue::input), this never predicts.
    pub fn confirmed_input(&self, requested_frame: Frame) -> Result<&GameInput, NetcodeError> {
        let offset = requested_frame.as_i32().rem_euclid(INPUT_QUEUE_LENGTH as i32) as usize;
        match self.inputs.get(offset) {
            Some(input) if input.frame == requested_frame && requested_frame.is_valid() => {
                Ok(input)
            },
            _ => Err(NetcodeError::InvalidRequest {
                info: format!(
                    "No confirmed input for frame {} (tail={}, head={}, length={})",
                    requested_frame, self.tail, self.head, self.length
                ),
            }),
        }
    }

    /// Discards confirmed frames **before** the given `frame` from the queue.
    ///
    /// After `discard_confirmed_frames(5)`, frames 0-4 are gone and frame 5 is the new tail.
    /// The most recent input always survives so the queue can keep predicting from it.
    pub fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        if self.length == 0 {
            return;
        }
        // never drop anything the session may still ask for
        if !self.last_requested_frame.is_null() {
            frame = cmp::min(frame, self.last_requested_frame);
        }

        let tail_frame = self.inputs[self.tail].frame;
        if frame > self.last_added_frame {
            self.tail = self.previous_position();
            self.length = 1;
        } else if frame <= tail_frame {
            // nothing older than the tail exists
        } else {
            let offset = (frame - tail_frame) as usize;
            self.tail = (self.tail + offset) % INPUT_QUEUE_LENGTH;
            self.length -= offset;
        }
    }

    /// Returns the input of this player for `requested_frame`, predicting it if needed.
    ///
    /// The prediction repeats the newest real input (zeroes before the first one). Once handed
    /// out, a prediction stays the same for all following frames until real input catches up.
    ///
    /// # Returns
    /// Returns `None` while a known misprediction is pending, or if the requested frame was
    /// already discarded. Neither happens in correct operation.
    pub fn input(&mut self, requested_frame: Frame) -> Option<(GameInput, InputStatus)> {
        // continuing on a known-wrong prediction would only dig deeper
        if !self.first_incorrect_frame.is_null() {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Attempted to get input while prediction error exists (first_incorrect_frame={})",
                self.first_incorrect_frame
            );
            return None;
        }

        self.last_requested_frame = requested_frame;

        if self.length > 0 && requested_frame < self.inputs[self.tail].frame {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Requested frame {} is before oldest frame {} in queue",
                requested_frame,
                self.inputs[self.tail].frame
            );
            return None;
        }

        if self.prediction.frame.is_null() {
            if self.length > 0 {
                let distance = (requested_frame - self.inputs[self.tail].frame) as usize;
                if distance < self.length {
                    let offset = (distance + self.tail) % INPUT_QUEUE_LENGTH;
                    let stored = &self.inputs[offset];
                    if stored.frame != requested_frame {
                        report_violation_to!(
                            self.observer,
                            ViolationSeverity::Critical,
                            ViolationKind::InputQueue,
                            "Circular buffer index mismatch: expected frame {}, got frame {} at offset {}",
                            requested_frame,
                            stored.frame,
                            offset
                        );
                        return None;
                    }
                    return Some((stored.clone(), InputStatus::Confirmed));
                }
            }

            // not in the queue yet, start predicting from the newest real input
            self.prediction = if self.length == 0 {
                GameInput::blank(requested_frame, self.input_size)
            } else {
                let mut last = self.inputs[self.previous_position()].clone();
                last.frame = requested_frame;
                last
            };
        }

        let mut predicted = self.prediction.clone();
        predicted.frame = requested_frame;
        Some((predicted, InputStatus::Predicted))
    }

    /// Adds a real input. Will consider the set frame delay.
    ///
    /// Returns the frame the input was stored at, or [`Frame::NULL`] if it was dropped because it
    /// was not the next input in sequence.
    pub fn add_input(&mut self, input: GameInput) -> Frame {
        if input.size() != self.input_size {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Input of {} bytes does not match queue input size {}",
                input.size(),
                self.input_size
            );
            return Frame::NULL;
        }
        // inputs must arrive sequentially, regardless of frame delay
        if !self.last_added_frame.is_null()
            && input.frame + self.frame_delay as i32 != self.last_added_frame + 1
        {
            return Frame::NULL;
        }

        let new_frame = self.advance_queue_head(input.frame);
        if !new_frame.is_null() && !self.add_input_by_frame(&input, new_frame) {
            return Frame::NULL;
        }
        new_frame
    }

    /// Adds a real input and reports whether it contradicts a prediction already handed out.
    ///
    /// Returns the frame the input was stored at together with the mismatch flag, or `None` if
    /// the input was dropped. Only the first mismatch since the last prediction reset is flagged.
    pub fn confirm(&mut self, input: GameInput) -> Option<(Frame, bool)> {
        let had_error = !self.first_incorrect_frame.is_null();
        let frame = self.add_input(input);
        if frame.is_null() {
            return None;
        }
        Some((frame, !had_error && self.first_incorrect_frame == frame))
    }

    fn previous_position(&self) -> usize {
        match self.head {
            0 => INPUT_QUEUE_LENGTH - 1,
            _ => self.head - 1,
        }
    }

    /// Stores `input` at `frame_number` and checks it against a pending prediction.
    /// Returns `false` if an invariant violation was detected.
    fn add_input_by_frame(&mut self, input: &GameInput, frame_number: Frame) -> bool {
        let previous_position = self.previous_position();

        if !self.last_added_frame.is_null() && frame_number != self.last_added_frame + 1 {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Input frame {} is not sequential (last_added={})",
                frame_number,
                self.last_added_frame
            );
            return false;
        }
        if frame_number != 0
            && self.length > 0
            && self.inputs[previous_position].frame != frame_number - 1
        {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Previous input frame {} does not precede current frame {}",
                self.inputs[previous_position].frame,
                frame_number
            );
            return false;
        }
        if self.length >= INPUT_QUEUE_LENGTH {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Critical,
                ViolationKind::InputQueue,
                "Queue overflow: length {} reached capacity {}",
                self.length,
                INPUT_QUEUE_LENGTH
            );
            return false;
        }

        let slot = &mut self.inputs[self.head];
        slot.bytes.clone_from(&input.bytes);
        slot.frame = frame_number;
        self.head = (self.head + 1) % INPUT_QUEUE_LENGTH;
        self.length += 1;

        self.first_frame = false;
        self.last_added_frame = frame_number;

        // we have been predicting, see if the real input matches
        if !self.prediction.frame.is_null() {
            if frame_number != self.prediction.frame {
                report_violation_to!(
                    self.observer,
                    ViolationSeverity::Error,
                    ViolationKind::InputQueue,
                    "Frame {} doesn't match prediction frame {}",
                    frame_number,
                    self.prediction.frame
                );
                return false;
            }

            if self.first_incorrect_frame.is_null() && !self.prediction.equal(input, true) {
                self.first_incorrect_frame = frame_number;
            }

            // leave prediction mode once real input caught up with the last request
            if self.prediction.frame == self.last_requested_frame
                && self.first_incorrect_frame.is_null()
            {
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame += 1;
            }
        }

        true
    }

    /// Advances the queue head to the frame the input belongs to after applying the delay.
    ///
    /// Frames skipped by the delay are filled with the previous input (zeroes at the very start),
    /// so the queue never contains a gap. Returns [`Frame::NULL`] if the input would be out of order.
    fn advance_queue_head(&mut self, input_frame: Frame) -> Frame {
        let mut expected_frame = if self.first_frame {
            Frame::new(0)
        } else {
            self.inputs[self.previous_position()].frame + 1
        };

        let input_frame = input_frame + self.frame_delay as i32;

        if expected_frame > input_frame {
            return Frame::NULL;
        }

        while expected_frame < input_frame {
            let filler = self.inputs[self.previous_position()].clone();
            if !self.add_input_by_frame(&filler, expected_frame) {
                return Frame::NULL;
            }
            expected_frame += 1;
        }

        input_frame
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod input_queue_tests {
    use super::*;

    fn input(frame: i32, value: u8) -> GameInput {
        GameInput::new(Frame::new(frame), &[value])
    }

    fn test_queue() -> InputQueue {
        InputQueue::new(1)
    }

    #[test]
    fn test_add_input_wrong_frame() {
        let mut queue = test_queue();
        assert_eq!(queue.add_input(input(0, 0)), Frame::new(0)); // fine
        assert_eq!(queue.add_input(input(3, 0)), Frame::NULL); // input dropped
    }

    #[test]
    fn test_add_input_twice() {
        let mut queue = test_queue();
        assert_eq!(queue.add_input(input(0, 0)), Frame::new(0));
        assert_eq!(queue.add_input(input(0, 0)), Frame::NULL);
    }

    #[test]
    fn test_add_input_wrong_size() {
        let mut queue = test_queue();
        let wide = GameInput::new(Frame::new(0), &[1, 2]);
        assert_eq!(queue.add_input(wide), Frame::NULL);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_input_sequentially() {
        let mut queue = test_queue();
        for i in 0..10i32 {
            queue.add_input(input(i, i as u8));
            assert_eq!(queue.last_added_frame(), Frame::new(i));
            assert_eq!(queue.len(), (i + 1) as usize);
            let (stored, status) = queue.input(Frame::new(i)).expect("input");
            assert_eq!(stored.bytes.as_slice(), &[i as u8]);
            assert_eq!(status, InputStatus::Confirmed);
        }
    }

    #[test]
    fn test_delayed_inputs() {
        let mut queue = test_queue();
        let delay: i32 = 2;
        queue.set_frame_delay(delay as usize).unwrap();
        for i in 0..10i32 {
            queue.add_input(input(i, (i + 1) as u8));
            assert_eq!(queue.last_added_frame(), Frame::new(i + delay));
            assert_eq!(queue.len(), (i + delay + 1) as usize);
            let (stored, _status) = queue.input(Frame::new(i)).expect("input");
            // the frames skipped by the delay are zero-filled
            let expected = if i < delay { 0 } else { (i - delay + 1) as u8 };
            assert_eq!(stored.bytes.as_slice(), &[expected]);
        }
    }

    #[test]
    fn test_frame_delay_too_large() {
        let mut queue = test_queue();
        assert!(queue.set_frame_delay(MAX_FRAME_DELAY).is_ok());
        assert!(queue.set_frame_delay(MAX_FRAME_DELAY + 1).is_err());
    }

    #[test]
    fn test_confirmed_input() {
        let mut queue = test_queue();
        for i in 0..5i32 {
            queue.add_input(input(i, (i * 10) as u8));
        }
        let confirmed = queue.confirmed_input(Frame::new(2)).unwrap();
        assert_eq!(confirmed.frame, Frame::new(2));
        assert_eq!(confirmed.bytes.as_slice(), &[20]);
        assert!(queue.confirmed_input(Frame::new(5)).is_err());
        assert!(queue.confirmed_input(Frame::NULL).is_err());
    }

    #[test]
    fn test_prediction_before_any_input_is_zero() {
        let mut queue = test_queue();
        let (predicted, status) = queue.input(Frame::new(0)).unwrap();
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(predicted.bytes.as_slice(), &[0]);
        assert_eq!(predicted.frame, Frame::new(0));
    }

    #[test]
    fn test_prediction_repeats_last_input() {
        let mut queue = test_queue();
        queue.add_input(input(0, 7));
        let (predicted, status) = queue.input(Frame::new(1)).unwrap();
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(predicted.bytes.as_slice(), &[7]);
        assert_eq!(predicted.frame, Frame::new(1));
    }

    #[test]
    fn test_first_incorrect_frame_detection() {
        let mut queue = test_queue();
        queue.add_input(input(0, 1));
        for frame in 1..4 {
            let _ = queue.input(Frame::new(frame)).unwrap();
        }
        assert_eq!(queue.confirm(input(1, 1)), Some((Frame::new(1), false)));
        assert_eq!(queue.confirm(input(2, 5)), Some((Frame::new(2), true)));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(2));
        // later mismatches do not move the first incorrect frame
        assert_eq!(queue.confirm(input(3, 6)), Some((Frame::new(3), false)));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(2));
        // no input is handed out while the error is pending
        assert!(queue.input(Frame::new(4)).is_none());
    }

    #[test]
    fn test_correct_prediction_leaves_prediction_mode() {
        let mut queue = test_queue();
        queue.add_input(input(0, 3));
        let _ = queue.input(Frame::new(1)).unwrap();
        let _ = queue.input(Frame::new(2)).unwrap();
        queue.add_input(input(1, 3));
        queue.add_input(input(2, 3));
        assert!(queue.first_incorrect_frame().is_null());
        let (stored, status) = queue.input(Frame::new(2)).unwrap();
        assert_eq!(status, InputStatus::Confirmed);
        assert_eq!(stored.bytes.as_slice(), &[3]);
    }

    #[test]
    fn test_reset_prediction() {
        let mut queue = test_queue();
        queue.add_input(input(0, 1));
        let _ = queue.input(Frame::new(1)).unwrap();
        queue.add_input(input(1, 2));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(1));
        queue.reset_prediction();
        assert!(queue.first_incorrect_frame().is_null());
        let (stored, status) = queue.input(Frame::new(1)).unwrap();
        assert_eq!(status, InputStatus::Confirmed);
        assert_eq!(stored.bytes.as_slice(), &[2]);
    }

    #[test]
    fn test_discard_confirmed_frames_partial() {
        let mut queue = test_queue();
        for i in 0..10 {
            queue.add_input(input(i, i as u8));
        }
        queue.discard_confirmed_frames(Frame::new(5));
        assert_eq!(queue.len(), 5);
        assert!(queue.confirmed_input(Frame::new(5)).is_ok());
        assert!(queue.input(Frame::new(4)).is_none());
    }

    #[test]
    fn test_discard_keeps_most_recent() {
        let mut queue = test_queue();
        for i in 0..10 {
            queue.add_input(input(i, i as u8));
        }
        queue.discard_confirmed_frames(Frame::new(50));
        assert_eq!(queue.len(), 1);
        let (predicted, status) = queue.input(Frame::new(10)).unwrap();
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(predicted.bytes.as_slice(), &[9]);
    }

    #[test]
    fn test_discard_respects_last_requested() {
        let mut queue = test_queue();
        for i in 0..10 {
            queue.add_input(input(i, i as u8));
        }
        let _ = queue.input(Frame::new(3)).unwrap();
        queue.discard_confirmed_frames(Frame::new(8));
        assert!(queue.confirmed_input(Frame::new(3)).is_ok());
        assert_eq!(queue.len(), 7);
    }

    #[test]
    fn test_queue_wraparound() {
        let mut queue = test_queue();
        for i in 0..(INPUT_QUEUE_LENGTH as i32 * 3) {
            assert_eq!(queue.add_input(input(i, i as u8)), Frame::new(i));
            let (stored, status) = queue.input(Frame::new(i)).unwrap();
            assert_eq!(status, InputStatus::Confirmed);
            assert_eq!(stored.bytes.as_slice(), &[i as u8]);
            queue.discard_confirmed_frames(Frame::new(i - 2));
        }
    }
}
