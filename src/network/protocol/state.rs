//! Protocol state machine for one remote endpoint.
//!
//! ```text
//!  Initializing ──synchronize()──► Synchronizing ──all roundtrips──► Synchronized
//!                                                                        │
//!                                                          first input   │
//!                                                          received      ▼
//!  Shutdown ◄──shutdown_delay── Disconnected ◄──timeout or request── Running
//! ```
//!
//! | From          | To            | Trigger                                    |
//! |---------------|---------------|--------------------------------------------|
//! | Initializing  | Synchronizing | `synchronize()` called                     |
//! | Synchronizing | Synchronized  | All sync roundtrips completed              |
//! | Synchronized  | Running       | First input packet decoded                 |
//! | any           | Disconnected  | Disconnect timeout, peer request or host   |
//! | Disconnected  | Shutdown      | Shutdown delay elapsed                     |

/// Internal state machine for the UDP protocol.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// Created, waiting for `synchronize()`. No messages are sent.
    Initializing,
    /// Exchanging `SyncRequest` / `SyncReply` packets with the peer.
    Synchronizing,
    /// The handshake completed. Inputs flow, but none arrived from the peer yet.
    Synchronized,
    /// At least one input packet from the peer was decoded.
    Running,
    /// The peer is gone. Waiting for `shutdown_delay` before shutting down.
    Disconnected,
    /// Terminal state. All messages are dropped.
    Shutdown,
}

impl ProtocolState {
    /// Returns a string representation for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Synchronizing => "synchronizing",
            Self::Synchronized => "synchronized",
            Self::Running => "running",
            Self::Disconnected => "disconnected",
            Self::Shutdown => "shutdown",
        }
    }

    /// `true` once the handshake completed, as long as the peer is connected.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Synchronized | Self::Running)
    }

    /// `true` once the handshake completed, including endpoints that disconnected later.
    #[must_use]
    pub const fn handshake_done(&self) -> bool {
        matches!(
            self,
            Self::Synchronized | Self::Running | Self::Disconnected | Self::Shutdown
        )
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_states() {
        assert!(!ProtocolState::Initializing.is_connected());
        assert!(!ProtocolState::Synchronizing.is_connected());
        assert!(ProtocolState::Synchronized.is_connected());
        assert!(ProtocolState::Running.is_connected());
        assert!(!ProtocolState::Disconnected.is_connected());
        assert!(!ProtocolState::Shutdown.is_connected());
    }

    #[test]
    fn test_handshake_done_includes_disconnected() {
        assert!(ProtocolState::Disconnected.handshake_done());
        assert!(ProtocolState::Shutdown.handshake_done());
        assert!(!ProtocolState::Synchronizing.handshake_done());
    }

    #[test]
    fn test_display() {
        assert_eq!(ProtocolState::Synchronized.to_string(), "synchronized");
    }
}
