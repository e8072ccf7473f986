//! Game stub implementations for testing.
//!
//! The session never owns the simulation: the test simulates frames itself with the inputs
//! `synchronize_input` returns, and the session replays frames through the callbacks during
//! rollbacks. Both paths go through the same [`StateStub::advance`], so a [`GameStub`] handle
//! kept by the test and the clone handed to the session share one game.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::must_use_candidate,
    clippy::missing_panics_doc
)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use rollback_netcode::hash::fnv1a_hash;
use rollback_netcode::{Event, Frame, SavedState, SessionCallbacks, SynchronizedInputs};

/// The simulated game: a frame counter and a running mix of every input seen.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateStub {
    pub frame: i32,
    pub state: u64,
}

impl StateStub {
    /// Simulates one frame. Disconnected players contribute nothing.
    pub fn advance(&mut self, inputs: &SynchronizedInputs) {
        let players = (0..inputs.num_players())
            .filter(|&player| !inputs.is_disconnected(player))
            .filter_map(|player| inputs.player(player));
        self.advance_with(players);
    }

    /// Simulates one frame from raw per-player inputs.
    pub fn advance_with<'a>(&mut self, players: impl IntoIterator<Item = &'a [u8]>) {
        for input in players {
            for &byte in input {
                self.state = self.state.wrapping_mul(31).wrapping_add(u64::from(byte) + 1);
            }
        }
        self.frame += 1;
    }

    fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).unwrap()
    }

    fn decode(buffer: &[u8]) -> Self {
        bincode::serde::decode_from_slice(buffer, bincode::config::standard())
            .unwrap()
            .0
    }
}

/// Everything the callbacks observed.
#[derive(Debug, Default)]
pub struct GameRecord {
    pub gs: StateStub,
    pub saves: usize,
    pub loads: usize,
    pub freed: usize,
    /// Frames simulated through [`SessionCallbacks::advance_frame`], i.e. during replays.
    pub replayed: usize,
    pub events: Vec<Event>,
    pub logs: Vec<String>,
    /// Mixes a hidden counter into every frame, which makes the game non-deterministic.
    pub leaky: bool,
    hidden: u64,
}

impl GameRecord {
    fn step(&mut self, inputs: &SynchronizedInputs) {
        self.gs.advance(inputs);
        if self.leaky {
            self.hidden += 1;
            self.gs.state = self.gs.state.wrapping_add(self.hidden);
        }
    }
}

/// A deterministic game. Cloning yields another handle on the same game.
#[derive(Debug, Clone, Default)]
pub struct GameStub {
    inner: Arc<Mutex<GameRecord>>,
}

impl GameStub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A game whose replays never match its first simulation.
    #[must_use]
    pub fn leaky() -> Self {
        let stub = Self::new();
        stub.inner.lock().leaky = true;
        stub
    }

    /// Simulates one frame on the host side.
    pub fn advance(&self, inputs: &SynchronizedInputs) {
        self.inner.lock().step(inputs);
    }

    pub fn state(&self) -> StateStub {
        self.inner.lock().gs
    }

    pub fn current_frame(&self) -> i32 {
        self.inner.lock().gs.frame
    }

    pub fn loads(&self) -> usize {
        self.inner.lock().loads
    }

    pub fn saves(&self) -> usize {
        self.inner.lock().saves
    }

    pub fn freed(&self) -> usize {
        self.inner.lock().freed
    }

    pub fn replayed(&self) -> usize {
        self.inner.lock().replayed
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.lock().logs.clone()
    }
}

impl SessionCallbacks for GameStub {
    fn save_game_state(&mut self, frame: Frame) -> SavedState {
        let mut record = self.inner.lock();
        assert_eq!(record.gs.frame, frame.as_i32());
        record.saves += 1;
        let checksum = fnv1a_hash(&record.gs);
        SavedState::with_checksum(record.gs.encode(), u128::from(checksum))
    }

    fn load_game_state(&mut self, buffer: &[u8]) -> bool {
        let mut record = self.inner.lock();
        record.loads += 1;
        record.gs = StateStub::decode(buffer);
        true
    }

    fn log_game_state(&mut self, filename: &str, _buffer: &[u8]) -> bool {
        self.inner.lock().logs.push(filename.to_owned());
        true
    }

    fn free_buffer(&mut self, _buffer: Vec<u8>) {
        self.inner.lock().freed += 1;
    }

    fn advance_frame(&mut self, inputs: &SynchronizedInputs) -> bool {
        let mut record = self.inner.lock();
        record.replayed += 1;
        record.step(inputs);
        true
    }

    fn on_event(&mut self, event: Event) -> bool {
        self.inner.lock().events.push(event);
        true
    }
}

/// The state after `frames` frames with the inputs `inputs_for(frame)`, simulated without any
/// network in between.
pub fn baseline(frames: i32, inputs_for: impl Fn(i32) -> Vec<Vec<u8>>) -> StateStub {
    let mut gs = StateStub::default();
    for frame in 0..frames {
        let inputs = inputs_for(frame);
        gs.advance_with(inputs.iter().map(Vec::as_slice));
    }
    gs
}
