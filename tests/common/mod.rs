//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a deterministic game driven through [`SessionCallbacks`](rollback_netcode::SessionCallbacks)
//! - `test_utils`: shared constants, port allocation and frame loop helpers
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! mod common;
//! use common::stubs::GameStub;
//! use common::{synchronize_sessions, test_addr};
//! ```

pub mod stubs;
pub mod test_utils;

// These are public utilities for integration tests - allow unused until tests adopt them.
#[allow(unused_imports)]
pub use test_utils::{
    advance_with_retry, init_tracing, poll_with_sleep, run_frame, synchronize_sessions, test_addr,
    PortAllocator, MAX_SYNC_ITERATIONS, POLL_INTERVAL, SYNC_TIMEOUT,
};
