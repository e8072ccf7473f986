use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::Frame;

/// Default window size for time synchronization frame advantage calculation.
const DEFAULT_FRAME_WINDOW_SIZE: usize = 40;
/// Default number of identical trailing inputs required when idle input is demanded.
const DEFAULT_MIN_UNIQUE_FRAMES: usize = 10;
/// Default advantage at which a stall is first recommended.
const DEFAULT_STALL_THRESHOLD: i32 = 3;
/// Default advantage at or below which a running stall recommendation is cleared.
const DEFAULT_STALL_RELEASE: i32 = 1;
/// Default upper bound for a single recommendation.
const DEFAULT_MAX_RECOMMENDATION: u32 = 9;

/// Configuration for time synchronization behavior.
///
/// The time sync system tracks local and remote frame advantages over a
/// sliding window to calculate how many frames this peer should stall so the
/// other peer(s) can catch up.
///
/// # Example
///
/// ```
/// use rollback_netcode::TimeSyncConfig;
///
/// // For smoother sync (slower to adapt to changes)
/// let smooth_config = TimeSyncConfig {
///     window_size: 60,
///     ..TimeSyncConfig::default()
/// };
/// assert_eq!(smooth_config.stall_threshold, 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncConfig {
    /// The number of frames to average when calculating frame advantage.
    ///
    /// Default: 40 frames
    pub window_size: usize,
    /// When idle input is required, the last `min_unique_frames` local inputs must be identical
    /// before a stall is recommended, so the stall is not felt by the player.
    ///
    /// Default: 10 frames
    pub min_unique_frames: usize,
    /// A stall is recommended once the advantage reaches this many frames.
    ///
    /// Default: 3
    pub stall_threshold: i32,
    /// A running stall recommendation is withdrawn once the advantage drops to this value.
    ///
    /// Default: 1
    pub stall_release: i32,
    /// Recommendations never exceed this many frames.
    ///
    /// Default: 9
    pub max_recommendation: u32,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_FRAME_WINDOW_SIZE,
            min_unique_frames: DEFAULT_MIN_UNIQUE_FRAMES,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
            stall_release: DEFAULT_STALL_RELEASE,
            max_recommendation: DEFAULT_MAX_RECOMMENDATION,
        }
    }
}

impl TimeSyncConfig {
    /// Creates a new `TimeSyncConfig` with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Handles time synchronization with one peer.
///
/// TimeSync tracks frame advantage differentials between local and remote peers,
/// using a rolling window average to smooth out network jitter.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Debug)]
pub struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
    last_inputs: Vec<Vec<u8>>,
    config: TimeSyncConfig,
    stalling: bool,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::with_config(TimeSyncConfig::default())
    }
}

impl TimeSync {
    /// Creates a new TimeSync with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new TimeSync with the given configuration.
    #[must_use]
    pub fn with_config(config: TimeSyncConfig) -> Self {
        let window_size = config.window_size.max(1);
        let min_unique = config.min_unique_frames.max(1);
        Self {
            local: vec![0; window_size],
            remote: vec![0; window_size],
            last_inputs: vec![Vec::new(); min_unique],
            config,
            stalling: false,
        }
    }

    /// Records the advantages measured when the local input for `frame` was sent.
    pub fn advance_frame(&mut self, frame: Frame, local_adv: i32, remote_adv: i32, input: &[u8]) {
        if !frame.is_valid() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "TimeSync::advance_frame called with invalid frame {:?}, skipping update",
                frame
            );
            return;
        }
        let index = frame.as_i32() as usize;
        let window = self.local.len();
        self.local[index % window] = local_adv;
        self.remote[index % window] = remote_adv;
        let inputs = self.last_inputs.len();
        let slot = &mut self.last_inputs[index % inputs];
        slot.clear();
        slot.extend_from_slice(input);
    }

    /// Calculates how many frames this peer is ahead, meeting the peer in the middle.
    ///
    /// Negative if this peer is behind.
    #[must_use]
    pub fn average_frame_advantage(&self) -> i32 {
        let local_avg = self.local.iter().sum::<i32>() as f32 / self.local.len() as f32;
        let remote_avg = self.remote.iter().sum::<i32>() as f32 / self.remote.len() as f32;
        ((remote_avg - local_avg) / 2.0).round() as i32
    }

    /// `true` while a stall recommendation is active.
    #[must_use]
    pub fn is_stalling(&self) -> bool {
        self.stalling
    }

    /// Recommends how many frames to stall.
    ///
    /// A recommendation starts once the advantage reaches `stall_threshold` and stays active until
    /// the advantage falls to `stall_release`. With `require_idle_input` the recommendation is
    /// suppressed unless the recent local inputs were all identical.
    pub fn recommend_frames_to_skip(&mut self, require_idle_input: bool) -> u32 {
        let advantage = self.average_frame_advantage();
        if self.stalling {
            if advantage <= self.config.stall_release {
                self.stalling = false;
                return 0;
            }
        } else if advantage < self.config.stall_threshold {
            return 0;
        } else {
            self.stalling = true;
        }

        if require_idle_input && !self.inputs_idle() {
            return 0;
        }

        (advantage.max(0) as u32).min(self.config.max_recommendation)
    }

    fn inputs_idle(&self) -> bool {
        match self.last_inputs.split_first() {
            Some((first, rest)) => rest.iter().all(|input| input == first),
            None => true,
        }
    }
}

// #########
// # TESTS #
// #########
