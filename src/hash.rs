//! Deterministic checksums for saved game states.
//!
//! Sync tests compare the checksum of a frame's first simulation with the checksum of its replay.
//! When the host does not provide a checksum in its [`SavedState`](crate::SavedState), the
//! session hashes the saved buffer with FNV-1a instead. The hash uses a fixed seed, so two
//! processes (or two peers) always agree on the checksum of identical bytes.
//!
//! ```
//! use rollback_netcode::hash::{fnv1a_checksum, DeterministicHasher};
//! use std::hash::Hasher;
//!
//! let mut hasher = DeterministicHasher::new();
//! hasher.write(b"state");
//! assert_eq!(u128::from(hasher.finish()), fnv1a_checksum(b"state"));
//! ```
//!
//! FNV-1a is NOT cryptographically secure. For game state checksums, this is fine.

use std::hash::{Hash, Hasher};

/// FNV-1a 64-bit offset basis constant.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime constant.
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// A deterministic hasher using the FNV-1a algorithm.
#[derive(Debug, Clone)]
pub struct DeterministicHasher {
    state: u64,
}

impl DeterministicHasher {
    /// Creates a new `DeterministicHasher` with the standard FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }
}

impl Default for DeterministicHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for DeterministicHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Computes a deterministic FNV-1a hash of any hashable value.
#[inline]
pub fn fnv1a_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DeterministicHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// FNV-1a over a raw byte buffer, widened to the checksum width of [`SavedState`](crate::SavedState).
#[inline]
#[must_use]
pub fn fnv1a_checksum(bytes: &[u8]) -> u128 {
    let mut hasher = DeterministicHasher::new();
    hasher.write(bytes);
    u128::from(hasher.finish())
}
