use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PlayerHandle};

/// This enum contains all errors this library can return. Most operations return a
/// [`Result<(), NetcodeError>`].
///
/// [`Result<(), NetcodeError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetcodeError {
    /// Something went wrong that does not fit any other category, e.g. a missing save state or a
    /// host callback reporting failure.
    GeneralFailure {
        /// What failed.
        context: String,
    },
    /// The session was closed. No further operations are possible.
    InvalidSession,
    /// The handle does not refer to a player that supports the requested operation.
    InvalidPlayerHandle {
        /// The offending handle.
        handle: PlayerHandle,
    },
    /// The player number is outside `1..=num_players`.
    PlayerOutOfRange {
        /// The requested 1-based player number.
        player_num: usize,
        /// The number of players the session was started with.
        num_players: usize,
    },
    /// The prediction window is exhausted. Keep calling `idle` until remote input arrives.
    PredictionThreshold,
    /// The operation is not available on this kind of session.
    Unsupported,
    /// The session is not yet synchronized with all remote sessions.
    NotSynchronized,
    /// The session is replaying frames and cannot accept this operation right now.
    InRollback,
    /// The input was not accepted, either because its frame was already consumed or because the
    /// prediction window is full.
    InputDropped,
    /// The player already disconnected.
    PlayerDisconnected {
        /// The disconnected player.
        handle: PlayerHandle,
    },
    /// The session cannot accept any more spectators.
    TooManySpectators,
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// A sync test replayed a frame and got a different checksum than the first simulation.
    MismatchedChecksum {
        /// The frame whose checksums differ.
        frame: Frame,
        /// Checksum of the first simulation.
        original: u128,
        /// Checksum of the replay.
        replayed: u128,
    },
    /// A network socket operation failed.
    Socket {
        /// A description of the socket error.
        context: String,
    },
}

impl NetcodeError {
    /// Maps this error to the numeric error table of the host contract.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            NetcodeError::GeneralFailure { .. }
            | NetcodeError::MismatchedChecksum { .. }
            | NetcodeError::Socket { .. } => ErrorCode::GeneralFailure,
            NetcodeError::InvalidSession => ErrorCode::InvalidSession,
            NetcodeError::InvalidPlayerHandle { .. } => ErrorCode::InvalidPlayerHandle,
            NetcodeError::PlayerOutOfRange { .. } => ErrorCode::PlayerOutOfRange,
            NetcodeError::PredictionThreshold => ErrorCode::PredictionThreshold,
            NetcodeError::Unsupported => ErrorCode::Unsupported,
            NetcodeError::NotSynchronized => ErrorCode::NotSynchronized,
            NetcodeError::InRollback => ErrorCode::InRollback,
            NetcodeError::InputDropped => ErrorCode::InputDropped,
            NetcodeError::PlayerDisconnected { .. } => ErrorCode::PlayerDisconnected,
            NetcodeError::TooManySpectators => ErrorCode::TooManySpectators,
            NetcodeError::InvalidRequest { .. } => ErrorCode::InvalidRequest,
        }
    }
}

impl Display for NetcodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetcodeError::GeneralFailure { context } => {
                write!(f, "General failure: {}", context)
            }
            NetcodeError::InvalidSession => {
                write!(f, "The session has been closed.")
            }
            NetcodeError::InvalidPlayerHandle { handle } => {
                write!(f, "Invalid player handle {} for this operation.", handle)
            }
            NetcodeError::PlayerOutOfRange {
                player_num,
                num_players,
            } => {
                write!(
                    f,
                    "Player number {} is out of range, the session has {} players.",
                    player_num, num_players
                )
            }
            NetcodeError::PredictionThreshold => {
                write!(
                    f,
                    "Prediction threshold is reached, cannot proceed without catching up."
                )
            }
            NetcodeError::Unsupported => {
                write!(f, "This operation is not supported by this session type.")
            }
            NetcodeError::NotSynchronized => {
                write!(
                    f,
                    "The session is not yet synchronized with all remote sessions."
                )
            }
            NetcodeError::InRollback => {
                write!(f, "The session is currently rolling back.")
            }
            NetcodeError::InputDropped => {
                write!(f, "The input was dropped.")
            }
            NetcodeError::PlayerDisconnected { handle } => {
                write!(f, "Player {} is already disconnected.", handle)
            }
            NetcodeError::TooManySpectators => {
                write!(f, "The session cannot accept more spectators.")
            }
            NetcodeError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            NetcodeError::MismatchedChecksum {
                frame,
                original,
                replayed,
            } => {
                write!(
                    f,
                    "Detected checksum mismatch on frame {}: original {:#x}, replayed {:#x}",
                    frame, original, replayed
                )
            }
            NetcodeError::Socket { context } => {
                write!(f, "Socket error: {}", context)
            }
        }
    }
}

impl Error for NetcodeError {}

impl From<std::io::Error> for NetcodeError {
    fn from(err: std::io::Error) -> Self {
        NetcodeError::Socket {
            context: err.to_string(),
        }
    }
}

/// The numeric error table of the host-facing contract.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// The call succeeded.
    Ok = 0,
    /// See [`NetcodeError::GeneralFailure`].
    GeneralFailure = -1,
    /// See [`NetcodeError::InvalidSession`].
    InvalidSession = 1,
    /// See [`NetcodeError::InvalidPlayerHandle`].
    InvalidPlayerHandle = 2,
    /// See [`NetcodeError::PlayerOutOfRange`].
    PlayerOutOfRange = 3,
    /// See [`NetcodeError::PredictionThreshold`].
    PredictionThreshold = 4,
    /// See [`NetcodeError::Unsupported`].
    Unsupported = 5,
    /// See [`NetcodeError::NotSynchronized`].
    NotSynchronized = 6,
    /// See [`NetcodeError::InRollback`].
    InRollback = 7,
    /// See [`NetcodeError::InputDropped`].
    InputDropped = 8,
    /// See [`NetcodeError::PlayerDisconnected`].
    PlayerDisconnected = 9,
    /// See [`NetcodeError::TooManySpectators`].
    TooManySpectators = 10,
    /// See [`NetcodeError::InvalidRequest`].
    InvalidRequest = 11,
}

impl ErrorCode {
    /// `true` only for [`ErrorCode::Ok`].
    #[must_use]
    pub const fn succeeded(self) -> bool {
        matches!(self, ErrorCode::Ok)
    }

    /// The raw numeric value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl<T> From<&Result<T, NetcodeError>> for ErrorCode {
    fn from(result: &Result<T, NetcodeError>) -> Self {
        match result {
            Ok(_) => ErrorCode::Ok,
            Err(err) => err.code(),
        }
    }
}

/// Mirrors the host-side success test on the result of any session operation.
pub fn succeeded<T>(result: &Result<T, NetcodeError>) -> bool {
    ErrorCode::from(result).succeeded()
}
