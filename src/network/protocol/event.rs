use crate::frame_info::GameInput;
use crate::PlayerHandle;

/// Events a [`UdpProtocol`](super::UdpProtocol) reports to the session owning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The first valid sync reply arrived.
    Connected,
    /// The handshake made progress: `count` of `total` roundtrips are done.
    Synchronizing {
        /// Required roundtrips.
        total: u32,
        /// Completed roundtrips.
        count: u32,
    },
    /// The handshake completed.
    Synchronized,
    /// A new input of one of the players living on the peer arrived.
    Input {
        /// The decoded input.
        input: GameInput,
        /// The player it belongs to.
        player: PlayerHandle,
    },
    /// The peer should be disconnected, by timeout or on its own request.
    Disconnected,
    /// No packet arrived for `disconnect_notify_start`.
    NetworkInterrupted {
        /// Milliseconds left until the disconnect timeout hits.
        disconnect_timeout: u128,
    },
    /// Packets arrive again after an interruption.
    NetworkResumed,
}
