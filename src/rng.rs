//! Minimal PCG32 random number generator.
//!
//! Used for handshake tokens and magic numbers of the peer protocol, and for the fault
//! injection decisions of [`ChaosSocket`](crate::ChaosSocket). Seeding with
//! [`Pcg32::seed_from_u64`] makes both fully reproducible.
//!
//! Reference: <https://www.pcg-random.org/>
//!
//! ```rust
//! use rollback_netcode::rng::Pcg32;
//!
//! let mut a = Pcg32::seed_from_u64(12345);
//! let mut b = Pcg32::seed_from_u64(12345);
//! assert_eq!(a.gen_range(0..100), b.gen_range(0..100));
//! ```

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::hash::DeterministicHasher;

/// PCG32 random number generator.
///
/// The PCG-XSH-RR variant with 64-bit state. NOT cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

/// Default increment for single-stream PCG32.
const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

/// Multiplier constant for the LCG step.
const PCG_MULTIPLIER: u64 = 6364136223846793005;

/// Distinguishes generators seeded from entropy within the same instant.
static ENTROPY_COUNTER: AtomicU64 = AtomicU64::new(0);

impl Pcg32 {
    /// Creates a new PCG32 generator with the given state and stream.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        // The increment must be odd
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Creates a generator whose sequence depends only on `seed`.
    #[must_use]
    pub const fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    /// Creates a generator seeded from wall-clock time and thread identity.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self::seed_from_u64(entropy_seed())
    }

    /// Generates the next 32-bit random value.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        // XSH-RR output permutation
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Generates the next 64-bit random value by combining two 32-bit values.
    #[inline]
    #[must_use]
    pub fn next_u64(&mut self) -> u64 {
        let high = u64::from(self.next_u32());
        let low = u64::from(self.next_u32());
        (high << 32) | low
    }

    /// A random `u16` that is never zero.
    #[must_use]
    pub fn nonzero_u16(&mut self) -> u16 {
        loop {
            let value = self.next_u32() as u16;
            if value != 0 {
                return value;
            }
        }
    }

    /// Generates a random `u32` value in `[low, high)`. Returns `range.start` for empty ranges.
    pub fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if range.is_empty() || span == 0 {
            return range.start;
        }
        // rejection sampling avoids modulo bias
        let threshold = span.wrapping_neg() % span;
        loop {
            let random_value = self.next_u32();
            if random_value >= threshold {
                return range.start.wrapping_add(random_value % span);
            }
        }
    }

    /// Returns `true` with the given probability, clamped to `[0.0, 1.0]`.
    pub fn gen_bool(&mut self, probability: f64) -> bool {
        let p = probability.clamp(0.0, 1.0);
        if p >= 1.0 {
            return true;
        }
        let threshold = (p * f64::from(u32::MAX)) as u32;
        self.next_u32() < threshold
    }
}

fn entropy_seed() -> u64 {
    let nanos = web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut hasher = DeterministicHasher::new();
    nanos.hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    ENTROPY_COUNTER
        .fetch_add(1, Ordering::Relaxed)
        .hash(&mut hasher);
    hasher.finish()
}
