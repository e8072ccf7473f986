/// The `NetworkStats` struct contains statistics about the connection to one remote peer.
///
/// It is a snapshot computed when requested through `network_stats`; nothing in it is kept
/// beyond the latest sample.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// The number of local inputs sent to the peer that it has not acknowledged yet.
    /// A long send queue hints at a high round-trip time or packet loss.
    pub send_queue_len: usize,
    /// The number of frames of remote input received ahead of the local simulation.
    pub recv_queue_len: usize,
    /// The roundtrip packet transmission time in milliseconds.
    pub ping: u128,
    /// The estimated bandwidth used towards the peer, in kilobits per second.
    pub kbps_sent: usize,
    /// The number of frames the local client is behind the remote client at this instant in time.
    /// For example, if the local client is running frame 1002 and the remote client is running
    /// frame 1009, this value will roughly equal 7.
    pub local_frames_behind: i32,
    /// The same as [`local_frames_behind`], but as reported by the remote peer.
    ///
    /// [`local_frames_behind`]: #structfield.local_frames_behind
    pub remote_frames_behind: i32,
}

impl NetworkStats {
    /// Creates a new `NetworkStats` instance with default values.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            send_queue_len,
            recv_queue_len,
            ping,
            kbps_sent,
            local_frames_behind,
            remote_frames_behind,
        } = self;

        write!(
            f,
            "NetworkStats {{ ping: {}ms, send_queue: {}, recv_queue: {}, kbps: {}, local_behind: {}, remote_behind: {} }}",
            ping, send_queue_len, recv_queue_len, kbps_sent, local_frames_behind, remote_frames_behind
        )
    }
}
