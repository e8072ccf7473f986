//! Shared test utilities for integration tests.
//!
//! # Port Allocation
//!
//! Tests that bind real UDP sockets take their ports from [`PortAllocator`], which hands out a
//! per-process range so parallel test binaries do not collide:
//!
//! ```ignore
//! use common::test_utils::PortAllocator;
//!
//! let (port1, port2) = PortAllocator::next_pair();
//! ```

#![allow(
    dead_code,
    clippy::panic,
    clippy::unwrap_used,
    clippy::must_use_candidate,
    clippy::missing_panics_doc
)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rollback_netcode::{NetcodeError, PlayerHandle, Session, SessionState};

use super::stubs::GameStub;

// ============================================================================
// Port Allocation System
// ============================================================================

/// Starting port for the atomic port allocator, above the registered service ports tests
/// usually collide with.
const PORT_ALLOCATOR_START: u16 = 30000;

/// Ports allocated per test process.
const PORTS_PER_PROCESS: u16 = 20;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);
static PORT_COUNTER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Thread-safe port allocator for integration tests.
pub struct PortAllocator;

impl PortAllocator {
    /// Picks the range of this process from its pid, once.
    fn initialize_counter() {
        if PORT_COUNTER_INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let max_offsets = (60000 - PORT_ALLOCATOR_START) / PORTS_PER_PROCESS;
            let offset_index = (std::process::id() % u32::from(max_offsets)) as u16;
            let start_port = PORT_ALLOCATOR_START + offset_index * PORTS_PER_PROCESS;
            PORT_COUNTER.store(start_port, Ordering::SeqCst);
        }
    }

    /// Allocates the next available port.
    #[must_use]
    pub fn next_port() -> u16 {
        Self::initialize_counter();
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        assert!(
            port < 60000,
            "Port allocator exhausted. This indicates a test suite issue."
        );
        port
    }

    /// Allocates two ports for a two-peer test.
    #[must_use]
    pub fn next_pair() -> (u16, u16) {
        (Self::next_port(), Self::next_port())
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of poll iterations while waiting for sessions to synchronize.
pub const MAX_SYNC_ITERATIONS: usize = 2000;

/// Time to sleep between poll iterations, so the network layer gets to deliver packets.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Maximum time to wait for synchronization to complete.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates a test socket address with localhost IP and the given port.
pub fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Routes library logs to the captured test output, visible with `--nocapture`.
///
/// Only the first call in a test binary installs the subscriber.
pub fn init_tracing() {
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish(),
    );
}

// ============================================================================
// Synchronization Helpers
// ============================================================================

/// Idles all sessions until every one of them is `Running`.
///
/// # Returns
/// - `Ok(iterations)` if all sessions synchronized
/// - `Err(message)` on timeout
#[track_caller]
pub fn synchronize_sessions(sessions: &mut [&mut dyn Session]) -> Result<usize, String> {
    init_tracing();
    let start = Instant::now();
    let mut iterations = 0;
    while sessions
        .iter()
        .any(|session| session.current_state() != SessionState::Running)
    {
        if iterations >= MAX_SYNC_ITERATIONS || start.elapsed() > SYNC_TIMEOUT {
            let states: Vec<SessionState> =
                sessions.iter().map(|session| session.current_state()).collect();
            return Err(format!(
                "Synchronization timed out after {iterations} iterations ({:?}), states: {states:?}",
                start.elapsed()
            ));
        }
        for session in sessions.iter_mut() {
            session.idle(0).map_err(|err| err.to_string())?;
        }
        iterations += 1;
        thread::sleep(POLL_INTERVAL);
    }
    Ok(iterations)
}

/// Idles all sessions `iterations` times with a short sleep in between.
pub fn poll_with_sleep(sessions: &mut [&mut dyn Session], iterations: usize) {
    for _ in 0..iterations {
        for session in sessions.iter_mut() {
            session.idle(0).unwrap();
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// One host frame: add the local input, fetch all inputs, simulate them on `game` and advance.
///
/// A failure of `add_local_input` leaves the frame untouched, so the caller can retry it.
pub fn run_frame(
    session: &mut dyn Session,
    game: &GameStub,
    handle: PlayerHandle,
    input: &[u8],
) -> Result<(), NetcodeError> {
    session.add_local_input(handle, input)?;
    let inputs = session.synchronize_input()?;
    game.advance(&inputs);
    session.advance_frame()
}

/// Runs one frame, idling and retrying while the session waits for remote input.
///
/// Adding the same input twice is reported as `InputDropped`, which is retried like the
/// prediction threshold: the input of this frame is already in and only synchronization is
/// missing.
#[track_caller]
pub fn advance_with_retry(
    session: &mut dyn Session,
    others: &mut [&mut dyn Session],
    game: &GameStub,
    handle: PlayerHandle,
    input: &[u8],
) {
    let start = Instant::now();
    let mut input_added = false;
    loop {
        assert!(
            start.elapsed() < SYNC_TIMEOUT,
            "frame {} never got its remote input",
            session.current_frame()
        );
        if !input_added {
            match session.add_local_input(handle, input) {
                Ok(()) => input_added = true,
                Err(NetcodeError::InputDropped | NetcodeError::PredictionThreshold) => {
                    idle_all(session, others);
                    continue;
                },
                Err(err) => panic!("add_local_input failed: {err}"),
            }
        }
        match session.synchronize_input() {
            Ok(inputs) => {
                game.advance(&inputs);
                session.advance_frame().unwrap();
                return;
            },
            Err(NetcodeError::PredictionThreshold) => idle_all(session, others),
            Err(err) => panic!("synchronize_input failed: {err}"),
        }
    }
}

fn idle_all(session: &mut dyn Session, others: &mut [&mut dyn Session]) {
    session.idle(0).unwrap();
    for other in others.iter_mut() {
        other.idle(0).unwrap();
    }
    thread::sleep(POLL_INTERVAL);
}
