//! The per-peer protocol: handshake, redundant input transmission, acks, quality probes and
//! timeouts for one remote endpoint.
//!
//! A session owns one [`UdpProtocol`] per remote endpoint. The session feeds it received
//! messages and local inputs, drains its [`Event`]s in `poll`, and flushes its send queue to the
//! socket once per update.

mod event;
mod state;

pub use event::Event;
pub use state::ProtocolState;

use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::frame_info::GameInput;
use crate::network::codec;
use crate::network::compression::{decode, encode};
use crate::network::messages::{
    ConnectionStatus, Input, InputAck, Message, MessageBody, MessageHeader, QualityReply,
    QualityReport, SyncReply, SyncRequest,
};
use crate::network::network_stats::NetworkStats;
use crate::rng::Pcg32;
use crate::sessions::config::{ProtocolConfig, SyncConfig};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::time_sync::{TimeSync, TimeSyncConfig};
use crate::{report_violation, report_violation_to, Frame, NetcodeError, NonBlockingSocket};
use crate::{PlayerHandle, MAX_PLAYERS};

const UDP_HEADER_SIZE: usize = 28; // Size of IP + UDP headers

/// Sequence numbers further ahead than this are treated as stale wrap-arounds.
const MAX_SEQUENCE_DISTANCE: u16 = 1 << 15;

/// Sync requests after which a warning about the handshake is reported.
const SYNC_RETRY_WARNING_THRESHOLD: u32 = 10;

/// Outstanding sync tokens kept; older ones are forgotten.
const MAX_OUTSTANDING_SYNC_TOKENS: usize = 64;

/// Returns the current wall-clock time as milliseconds since `UNIX_EPOCH`.
///
/// Quality probes compare timestamps taken on this machine only, but `Instant` cannot travel
/// in a packet, so the wall clock is used. `None` if the clock sits before the epoch.
fn millis_since_epoch() -> Option<u128> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(duration) => Some(duration.as_millis()),
            Err(_) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::InternalError,
                    "system time is before UNIX_EPOCH, clock may have gone backwards"
                );
                None
            },
        }
    }
    #[cfg(target_arch = "wasm32")]
    {
        let time = js_sys::Date::new_0().get_time();
        if time >= 0.0 {
            Some(time as u128)
        } else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InternalError,
                "Date.getTime() returned a negative value, clock may be misconfigured"
            );
            None
        }
    }
}

/// Timing parameters of one endpoint, as configured on the session builder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndpointTiming {
    pub disconnect_timeout: Duration,
    pub disconnect_notify_start: Duration,
    pub fps: usize,
    pub sync: SyncConfig,
    pub protocol: ProtocolConfig,
    pub time_sync: TimeSyncConfig,
}

/// Protocol handler for one remote endpoint.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
pub struct UdpProtocol {
    /// Players living on the peer, sorted. Empty for a spectator endpoint.
    handles: Vec<PlayerHandle>,
    input_size: usize,
    /// Bytes of one frame of input this endpoint sends to the peer.
    send_frame_size: usize,
    send_queue: VecDeque<Message>,
    event_queue: VecDeque<Event>,

    // state
    state: ProtocolState,
    sync_remaining_roundtrips: u32,
    sync_random_requests: BTreeSet<u32>,
    sync_requests_sent: u32,
    sync_last_request: Instant,
    running_last_quality_report: Instant,
    running_last_input_recv: Instant,
    running_last_network_stats: Instant,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,

    // constants
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    shutdown_timeout: Instant,
    fps: usize,
    magic: u16,
    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,

    // packet sequencing
    next_send_seq: u16,
    last_recv_seq: Option<u16>,

    // the other client
    peer_addr: SocketAddr,
    remote_magic: u16,
    peer_connect_status: Vec<ConnectionStatus>,

    // input compression
    pending_output: VecDeque<GameInput>,
    last_acked_input: GameInput,
    recv_inputs: BTreeMap<Frame, GameInput>,
    first_recv_frame: Frame,
    last_recv_frame: Frame,

    // time sync
    time_sync_layer: TimeSync,
    local_frame: Frame,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // network
    stats_start_time: Instant,
    packets_sent: usize,
    bytes_sent: usize,
    kbps_sent: usize,
    round_trip_time: u128,
    last_send_time: Instant,
    last_recv_time: Instant,

    rng: Pcg32,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for UdpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpProtocol")
            .field("peer_addr", &self.peer_addr)
            .field("handles", &self.handles)
            .field("state", &self.state)
            .field("magic", &self.magic)
            .field("remote_magic", &self.remote_magic)
            .field("pending_output", &self.pending_output.len())
            .field("last_recv_frame", &self.last_recv_frame)
            .finish_non_exhaustive()
    }
}

impl UdpProtocol {
    /// Creates an endpoint for `peer_addr`.
    ///
    /// `handles` are the players whose inputs the peer sends; `send_frame_size` is the number of
    /// bytes per frame this side sends (all local players, or every player for a spectator).
    pub(crate) fn new(
        mut handles: Vec<PlayerHandle>,
        peer_addr: SocketAddr,
        num_players: usize,
        input_size: usize,
        send_frame_size: usize,
        timing: EndpointTiming,
        observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        handles.sort_unstable();
        handles.dedup();

        let mut rng = timing
            .protocol
            .protocol_rng_seed
            .map_or_else(Pcg32::from_entropy, Pcg32::seed_from_u64);
        let magic = rng.nonzero_u16();

        let recv_frame_size = handles.len() * input_size;
        let mut recv_inputs = BTreeMap::new();
        recv_inputs.insert(Frame::NULL, GameInput::blank(Frame::NULL, recv_frame_size));

        let now = Instant::now();
        Self {
            handles,
            input_size,
            send_frame_size,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),

            state: ProtocolState::Initializing,
            sync_remaining_roundtrips: timing.sync.num_sync_packets,
            sync_random_requests: BTreeSet::new(),
            sync_requests_sent: 0,
            sync_last_request: now,
            running_last_quality_report: now,
            running_last_input_recv: now,
            running_last_network_stats: now,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,

            disconnect_timeout: timing.disconnect_timeout,
            disconnect_notify_start: timing.disconnect_notify_start,
            shutdown_timeout: now,
            fps: timing.fps,
            magic,
            sync_config: timing.sync,
            protocol_config: timing.protocol,

            next_send_seq: 0,
            last_recv_seq: None,

            peer_addr,
            remote_magic: 0,
            peer_connect_status: vec![ConnectionStatus::default(); num_players.min(MAX_PLAYERS)],

            pending_output: VecDeque::with_capacity(timing.protocol.pending_output_limit),
            last_acked_input: GameInput::blank(Frame::NULL, send_frame_size),
            recv_inputs,
            first_recv_frame: Frame::NULL,
            last_recv_frame: Frame::NULL,

            time_sync_layer: TimeSync::with_config(timing.time_sync),
            local_frame: Frame::NULL,
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            stats_start_time: now,
            packets_sent: 0,
            bytes_sent: 0,
            kbps_sent: 0,
            round_trip_time: 0,
            last_send_time: now,
            last_recv_time: now,

            rng,
            observer,
        }
    }

    /// Players whose inputs arrive through this endpoint.
    pub(crate) fn handles(&self) -> &[PlayerHandle] {
        &self.handles
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ProtocolState {
        self.state
    }

    /// `true` once the handshake completed, even if the endpoint disconnected afterwards.
    pub(crate) fn is_synchronized(&self) -> bool {
        self.state.handshake_done()
    }

    /// `true` while inputs are exchanged with the peer.
    pub(crate) fn is_running(&self) -> bool {
        self.state.is_connected()
    }

    pub(crate) fn set_disconnect_timeout(&mut self, timeout: Duration) {
        self.disconnect_timeout = timeout;
    }

    pub(crate) fn set_disconnect_notify_start(&mut self, notify_start: Duration) {
        self.disconnect_notify_start = notify_start;
    }

    /// The last status the peer reported for `handle`.
    pub(crate) fn peer_connect_status(&self, handle: PlayerHandle) -> ConnectionStatus {
        self.peer_connect_status
            .get(handle.as_usize())
            .copied()
            .unwrap_or_default()
    }

    /// The magic number this endpoint stamps on its packets.
    #[cfg(test)]
    pub(crate) fn magic(&self) -> u16 {
        self.magic
    }

    /// Marks the endpoint disconnected. It shuts down for good after the shutdown delay.
    pub(crate) fn disconnect(&mut self) {
        if self.state == ProtocolState::Shutdown {
            return;
        }
        debug!(peer = %self.peer_addr, "endpoint disconnected");
        self.state = ProtocolState::Disconnected;
        self.shutdown_timeout = Instant::now() + self.protocol_config.shutdown_delay;
    }

    /// Starts the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`NetcodeError::InvalidRequest`] unless the endpoint is still initializing.
    pub(crate) fn synchronize(&mut self) -> Result<(), NetcodeError> {
        if self.state != ProtocolState::Initializing {
            return Err(NetcodeError::InvalidRequest {
                info: format!("cannot synchronize an endpoint in state {}", self.state),
            });
        }
        self.state = ProtocolState::Synchronizing;
        self.sync_remaining_roundtrips = self.sync_config.num_sync_packets;
        self.stats_start_time = Instant::now();
        self.send_sync_request();
        Ok(())
    }

    /// Frames the local simulation should skip to let this peer catch up.
    pub(crate) fn recommend_frames_to_skip(&mut self) -> u32 {
        self.time_sync_layer.recommend_frames_to_skip(false)
    }

    /// Estimates how far ahead of the peer the local simulation runs.
    ///
    /// The peer's current frame is extrapolated from the last received input and half the RTT.
    pub(crate) fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        self.local_frame = local_frame;
        if local_frame.is_null() || self.last_recv_frame.is_null() {
            return;
        }
        let ping = self.round_trip_time / 2;
        let frames_in_flight = ping.saturating_mul(self.fps as u128) / 1000;
        let remote_frame = self.last_recv_frame + i32::try_from(frames_in_flight).unwrap_or(i32::MAX);
        self.local_frame_advantage = remote_frame - local_frame;
    }

    pub(crate) fn network_stats(&self) -> NetworkStats {
        let recv_queue_len = if self.last_recv_frame.is_valid() && self.local_frame.is_valid() {
            usize::try_from((self.last_recv_frame - self.local_frame).max(0)).unwrap_or(0)
        } else {
            0
        };
        NetworkStats {
            send_queue_len: self.pending_output.len(),
            recv_queue_len,
            ping: self.round_trip_time,
            kbps_sent: self.kbps_sent,
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
        }
    }

    fn update_network_stats(&mut self) {
        self.running_last_network_stats = Instant::now();
        let seconds = self.stats_start_time.elapsed().as_secs().max(1);
        let total_bytes_sent = self.bytes_sent + self.packets_sent * UDP_HEADER_SIZE;
        let bytes_per_second = total_bytes_sent / usize::try_from(seconds).unwrap_or(usize::MAX);
        self.kbps_sent = bytes_per_second / 1024;
    }

    /// Runs the timers of the endpoint and returns the events collected since the last poll.
    pub(crate) fn poll(&mut self, connect_status: &[ConnectionStatus]) -> Drain<'_, Event> {
        let now = Instant::now();
        match self.state {
            ProtocolState::Synchronizing => {
                let interval = if self.sync_remaining_roundtrips == self.sync_config.num_sync_packets
                {
                    self.sync_config.sync_first_retry_interval
                } else {
                    self.sync_config.sync_retry_interval
                };
                if self.sync_last_request + interval < now {
                    self.send_sync_request();
                }
            },
            ProtocolState::Synchronized | ProtocolState::Running => {
                // resend pending inputs, if some time has passed without receiving inputs
                if self.running_last_input_recv + self.sync_config.running_retry_interval < now {
                    self.send_pending_output(connect_status);
                    self.running_last_input_recv = now;
                }

                if self.running_last_quality_report + self.protocol_config.quality_report_interval
                    < now
                {
                    self.send_quality_report();
                }

                if self.running_last_network_stats + self.protocol_config.network_stats_interval
                    < now
                {
                    self.update_network_stats();
                }

                if self.last_send_time + self.sync_config.keepalive_interval < now {
                    self.send_keep_alive();
                }

                if !self.disconnect_timeout.is_zero() {
                    if !self.disconnect_notify_start.is_zero()
                        && !self.disconnect_notify_sent
                        && self.last_recv_time + self.disconnect_notify_start < now
                    {
                        let remaining = self
                            .disconnect_timeout
                            .saturating_sub(self.disconnect_notify_start);
                        self.event_queue.push_back(Event::NetworkInterrupted {
                            disconnect_timeout: remaining.as_millis(),
                        });
                        self.disconnect_notify_sent = true;
                    }

                    if !self.disconnect_event_sent
                        && self.last_recv_time + self.disconnect_timeout < now
                    {
                        self.event_queue.push_back(Event::Disconnected);
                        self.disconnect_event_sent = true;
                    }
                }
            },
            ProtocolState::Disconnected => {
                if self.shutdown_timeout < now {
                    debug!(peer = %self.peer_addr, "endpoint shut down");
                    self.state = ProtocolState::Shutdown;
                }
            },
            ProtocolState::Initializing | ProtocolState::Shutdown => (),
        }
        self.event_queue.drain(..)
    }

    fn pop_pending_output(&mut self, ack_frame: Frame) {
        while self
            .pending_output
            .front()
            .is_some_and(|input| input.frame <= ack_frame)
        {
            if let Some(popped) = self.pending_output.pop_front() {
                self.last_acked_input = popped;
            }
        }
    }

    /*
     *  SENDING MESSAGES
     */

    pub(crate) fn send_all_messages(&mut self, socket: &mut dyn NonBlockingSocket) {
        if self.state == ProtocolState::Shutdown {
            trace!(
                dropped = self.send_queue.len(),
                "endpoint is shut down, dropping queued messages"
            );
            self.send_queue.clear();
            return;
        }

        for msg in self.send_queue.drain(..) {
            socket.send_to(&msg, &self.peer_addr);
        }
    }

    /// Queues one frame of local input and sends everything not yet acknowledged.
    pub(crate) fn send_input(&mut self, input: GameInput, connect_status: &[ConnectionStatus]) {
        if self.queue_input(input) {
            self.send_pending_output(connect_status);
        }
    }

    /// Queues one frame of local input without sending. Returns `false` if the endpoint is not
    /// exchanging inputs.
    pub(crate) fn queue_input(&mut self, input: GameInput) -> bool {
        if !self.state.is_connected() {
            return false;
        }
        if input.size() != self.send_frame_size {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Error,
                ViolationKind::InternalError,
                "queued {} bytes of input for frame {}, expected {}",
                input.size(),
                input.frame,
                self.send_frame_size
            );
            return false;
        }

        self.time_sync_layer.advance_frame(
            input.frame,
            self.local_frame_advantage,
            self.remote_frame_advantage,
            &input.bytes,
        );
        self.pending_output.push_back(input);

        // a peer that stops acking for this long is gone
        if self.pending_output.len() > self.protocol_config.pending_output_limit
            && !self.disconnect_event_sent
        {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "{} unacknowledged inputs for {}, disconnecting",
                self.pending_output.len(),
                self.peer_addr
            );
            self.event_queue.push_back(Event::Disconnected);
            self.disconnect_event_sent = true;
        }
        true
    }

    /// Sends all unacknowledged inputs queued with [`Self::queue_input`].
    pub(crate) fn flush_input(&mut self, connect_status: &[ConnectionStatus]) {
        if self.state.is_connected() {
            self.send_pending_output(connect_status);
        }
    }

    /// Sends every unacknowledged input. With nothing pending the packet carries no inputs but
    /// still refreshes the peer's view of our acks and connect status.
    fn send_pending_output(&mut self, connect_status: &[ConnectionStatus]) {
        let start_frame = match self.pending_output.front() {
            Some(front) => front.frame,
            None => self.last_acked_input.frame + 1,
        };
        if self.last_acked_input.frame.is_valid() && self.last_acked_input.frame + 1 != start_frame
        {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "input sequence broken: last acked {}, first pending {}",
                self.last_acked_input.frame,
                start_frame
            );
            return;
        }

        let body = Input {
            peer_connect_status: connect_status.to_vec(),
            disconnect_requested: self.state == ProtocolState::Disconnected,
            start_frame,
            ack_frame: self.last_recv_frame,
            input_size: u16::try_from(self.send_frame_size).unwrap_or(u16::MAX),
            bytes: encode(
                &self.last_acked_input.bytes,
                self.pending_output.iter().map(|gi| gi.bytes.as_slice()),
            ),
        };
        trace!(
            pending = self.pending_output.len(),
            encoded = body.bytes.len(),
            start = %body.start_frame,
            "sending input"
        );
        self.queue_message(MessageBody::Input(body));
    }

    fn send_input_ack(&mut self) {
        let body = InputAck {
            ack_frame: self.last_recv_frame,
        };
        self.queue_message(MessageBody::InputAck(body));
    }

    fn send_keep_alive(&mut self) {
        self.queue_message(MessageBody::KeepAlive);
    }

    fn send_sync_request(&mut self) {
        self.sync_requests_sent += 1;
        if self.sync_requests_sent == SYNC_RETRY_WARNING_THRESHOLD {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Warning,
                ViolationKind::Synchronization,
                "{} sync requests sent to {} without completing the handshake",
                self.sync_requests_sent,
                self.peer_addr
            );
        }

        let random_request = self.rng.next_u32();
        if self.sync_random_requests.len() >= MAX_OUTSTANDING_SYNC_TOKENS {
            self.sync_random_requests.pop_first();
        }
        self.sync_random_requests.insert(random_request);
        self.sync_last_request = Instant::now();

        let body = SyncRequest {
            random_request,
            remote_magic: self.remote_magic,
        };
        self.queue_message(MessageBody::SyncRequest(body));
    }

    fn send_quality_report(&mut self) {
        self.running_last_quality_report = Instant::now();

        let Some(ping) = millis_since_epoch() else {
            trace!("skipping quality report, system clock is invalid");
            return;
        };
        let clamped = self
            .local_frame_advantage
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX));
        let body = QualityReport {
            frame_advantage: i16::try_from(clamped).unwrap_or(0),
            ping,
        };
        self.queue_message(MessageBody::QualityReport(body));
    }

    fn queue_message(&mut self, body: MessageBody) {
        let header = MessageHeader {
            magic: self.magic,
            sequence: self.next_send_seq,
        };
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        let msg = Message { header, body };

        self.packets_sent += 1;
        self.last_send_time = Instant::now();
        self.bytes_sent += codec::encode_message(&msg).map_or(0, |bytes| bytes.len());

        self.send_queue.push_back(msg);
    }

    /*
     *  RECEIVING MESSAGES
     */

    pub(crate) fn handle_message(&mut self, msg: &Message) {
        if self.state == ProtocolState::Shutdown {
            trace!(kind = msg.kind(), "endpoint is shut down, ignoring message");
            return;
        }

        let is_handshake = matches!(
            msg.body,
            MessageBody::SyncRequest(_) | MessageBody::SyncReply(_)
        );
        if is_handshake {
            // filter packets from other endpoints once we know the peer's magic
            if self.remote_magic != 0 && msg.header.magic != self.remote_magic {
                trace!(magic = msg.header.magic, "handshake packet with wrong magic");
                return;
            }
        } else {
            // everything but the handshake requires an authorized peer
            if self.remote_magic == 0 || msg.header.magic != self.remote_magic {
                trace!(magic = msg.header.magic, kind = msg.kind(), "packet from unknown endpoint");
                return;
            }
            if let Some(last) = self.last_recv_seq {
                let skipped = msg.header.sequence.wrapping_sub(last);
                if skipped > MAX_SEQUENCE_DISTANCE {
                    trace!(
                        sequence = msg.header.sequence,
                        last,
                        "dropping out-of-order packet"
                    );
                    return;
                }
            }
            self.last_recv_seq = Some(msg.header.sequence);
        }

        self.last_recv_time = Instant::now();

        if self.disconnect_notify_sent && self.state.is_connected() {
            self.disconnect_notify_sent = false;
            self.event_queue.push_back(Event::NetworkResumed);
        }

        match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(*body),
            MessageBody::SyncReply(body) => self.on_sync_reply(msg.header, *body),
            MessageBody::Input(body) => self.on_input(body),
            MessageBody::InputAck(body) => self.on_input_ack(*body),
            MessageBody::QualityReport(body) => self.on_quality_report(body),
            MessageBody::QualityReply(body) => self.on_quality_reply(body),
            MessageBody::KeepAlive => (),
        }
    }

    /// Answers a sync request by echoing its token.
    fn on_sync_request(&mut self, body: SyncRequest) {
        // the requester talked to an earlier endpoint on our address
        if body.remote_magic != 0 && body.remote_magic != self.magic {
            trace!(
                expected = self.magic,
                got = body.remote_magic,
                "sync request addressed to another endpoint"
            );
            return;
        }
        let reply_body = SyncReply {
            random_reply: body.random_request,
        };
        self.queue_message(MessageBody::SyncReply(reply_body));
    }

    /// Counts a roundtrip if the token matches one we sent, and concludes the handshake after
    /// the last one.
    fn on_sync_reply(&mut self, header: MessageHeader, body: SyncReply) {
        if self.state != ProtocolState::Synchronizing {
            return;
        }
        if !self.sync_random_requests.remove(&body.random_reply) {
            trace!(token = body.random_reply, "sync reply with unknown token");
            return;
        }

        if self.sync_remaining_roundtrips == self.sync_config.num_sync_packets {
            self.event_queue.push_back(Event::Connected);
        }
        self.sync_remaining_roundtrips = self.sync_remaining_roundtrips.saturating_sub(1);
        if self.sync_remaining_roundtrips > 0 {
            self.event_queue.push_back(Event::Synchronizing {
                total: self.sync_config.num_sync_packets,
                count: self.sync_config.num_sync_packets - self.sync_remaining_roundtrips,
            });
            self.send_sync_request();
        } else {
            debug!(
                peer = %self.peer_addr,
                requests = self.sync_requests_sent,
                elapsed_ms = self.stats_start_time.elapsed().as_millis(),
                "endpoint synchronized"
            );
            self.state = ProtocolState::Synchronized;
            self.remote_magic = header.magic;
            let now = Instant::now();
            self.running_last_input_recv = now;
            self.running_last_quality_report = now;
            self.event_queue.push_back(Event::Synchronized);
        }
    }

    fn recv_frame_size(&self) -> usize {
        self.handles.len() * self.input_size
    }

    fn on_input(&mut self, body: &Input) {
        self.pop_pending_output(body.ack_frame);

        if body.disconnect_requested {
            if self.state != ProtocolState::Disconnected && !self.disconnect_event_sent {
                self.event_queue.push_back(Event::Disconnected);
                self.disconnect_event_sent = true;
            }
        } else {
            for (local, remote) in self
                .peer_connect_status
                .iter_mut()
                .zip(body.peer_connect_status.iter())
            {
                local.disconnected = remote.disconnected || local.disconnected;
                local.last_frame = std::cmp::max(local.last_frame, remote.last_frame);
            }
        }

        // nothing pending on the peer's side, the packet only refreshed acks and status
        if body.bytes.is_empty() {
            return;
        }

        let recv_frame_size = self.recv_frame_size();
        if recv_frame_size == 0 {
            return;
        }
        if usize::from(body.input_size) != recv_frame_size {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "peer {} sends {} bytes per frame, expected {}",
                self.peer_addr,
                body.input_size,
                recv_frame_size
            );
            return;
        }

        let last_recv = self.last_recv_frame;
        if last_recv.is_valid() && body.start_frame > last_recv + 1 {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "input starts at frame {} but the last received frame is {}",
                body.start_frame,
                last_recv
            );
            return;
        }

        // the sender encodes against its last acked input, which is blank until we ack anything
        let decode_frame = if last_recv.is_null() || body.start_frame == self.first_recv_frame {
            Frame::NULL
        } else {
            body.start_frame - 1
        };
        let Some(reference) = self.recv_inputs.get(&decode_frame) else {
            trace!(frame = %decode_frame, "reference input already discarded");
            return;
        };

        let decoded = match decode(&reference.bytes, &body.bytes) {
            Ok(inputs) => inputs,
            Err(err) => {
                report_violation_to!(
                    self.observer,
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "failed to decode input packet from {}: {}",
                    self.peer_addr,
                    err
                );
                return;
            },
        };

        self.running_last_input_recv = Instant::now();
        for (offset, bytes) in decoded.into_iter().enumerate() {
            let frame = body.start_frame + i32::try_from(offset).unwrap_or(i32::MAX);
            if frame <= self.last_recv_frame {
                continue;
            }

            for (&player, chunk) in self.handles.iter().zip(bytes.chunks_exact(self.input_size)) {
                self.event_queue.push_back(Event::Input {
                    input: GameInput::new(frame, chunk),
                    player,
                });
            }
            self.recv_inputs.insert(frame, GameInput::new(frame, &bytes));
            if self.first_recv_frame.is_null() {
                self.first_recv_frame = frame;
            }
            self.last_recv_frame = frame;
        }

        if self.state == ProtocolState::Synchronized {
            debug!(peer = %self.peer_addr, "first input received, endpoint running");
            self.state = ProtocolState::Running;
        }

        self.send_input_ack();

        let history = i32::try_from(self.protocol_config.pending_output_limit).unwrap_or(i32::MAX);
        let oldest = self.last_recv_frame - history;
        self.recv_inputs
            .retain(|&frame, _| frame.is_null() || frame >= oldest);
    }

    fn on_input_ack(&mut self, body: InputAck) {
        self.pop_pending_output(body.ack_frame);
    }

    fn on_quality_report(&mut self, body: &QualityReport) {
        self.remote_frame_advantage = i32::from(body.frame_advantage);
        let reply_body = QualityReply { pong: body.ping };
        self.queue_message(MessageBody::QualityReply(reply_body));
    }

    fn on_quality_reply(&mut self, body: &QualityReply) {
        let Some(millis) = millis_since_epoch() else {
            trace!("skipping RTT update, system clock is invalid");
            return;
        };
        self.round_trip_time = millis.saturating_sub(body.pong);
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn timing() -> EndpointTiming {
        EndpointTiming {
            disconnect_timeout: Duration::from_millis(2000),
            disconnect_notify_start: Duration::from_millis(500),
            fps: 60,
            sync: SyncConfig::default(),
            protocol: ProtocolConfig::default(),
            time_sync: TimeSyncConfig::default(),
        }
    }

    /// Host side of a 2-player game talking to the peer that owns player 1.
    fn host(timing: EndpointTiming) -> UdpProtocol {
        UdpProtocol::new(vec![PlayerHandle::new(1)], addr(2), 2, 1, 1, timing, None)
    }

    /// Peer side, owning player 1 and receiving player 0.
    fn guest(timing: EndpointTiming) -> UdpProtocol {
        UdpProtocol::new(vec![PlayerHandle::new(0)], addr(1), 2, 1, 1, timing, None)
    }

    fn pump(from: &mut UdpProtocol, to: &mut UdpProtocol) -> usize {
        let messages: Vec<Message> = from.send_queue.drain(..).collect();
        for msg in &messages {
            to.handle_message(msg);
        }
        messages.len()
    }

    fn events(protocol: &mut UdpProtocol) -> Vec<Event> {
        protocol.poll(&[ConnectionStatus::default(); 2]).collect()
    }

    fn synced_pair() -> (UdpProtocol, UdpProtocol) {
        let mut a = host(timing());
        let mut b = guest(timing());
        a.synchronize().unwrap();
        b.synchronize().unwrap();
        for _ in 0..12 {
            pump(&mut a, &mut b);
            pump(&mut b, &mut a);
        }
        assert!(a.is_synchronized() && b.is_synchronized());
        a.event_queue.clear();
        b.event_queue.clear();
        (a, b)
    }

    #[test]
    fn test_new_protocol_is_initializing() {
        let protocol = host(timing());
        assert_eq!(protocol.state(), ProtocolState::Initializing);
        assert!(!protocol.is_synchronized());
        assert_ne!(protocol.magic(), 0);
        assert_eq!(protocol.handles(), &[PlayerHandle::new(1)]);
        assert_eq!(protocol.peer_addr(), addr(2));
    }

    #[test]
    fn test_synchronize_twice_fails() {
        let mut protocol = host(timing());
        protocol.synchronize().unwrap();
        assert_eq!(protocol.state(), ProtocolState::Synchronizing);
        assert_eq!(protocol.send_queue.len(), 1);
        assert!(protocol.synchronize().is_err());
    }

    #[test]
    fn test_handshake_completes_after_required_roundtrips() {
        let mut a = host(timing());
        let mut b = guest(timing());
        a.synchronize().unwrap();
        b.synchronize().unwrap();
        let mut a_events = Vec::new();
        for _ in 0..12 {
            pump(&mut a, &mut b);
            pump(&mut b, &mut a);
            a_events.extend(a.event_queue.drain(..));
        }
        assert_eq!(a.state(), ProtocolState::Synchronized);
        assert_eq!(b.state(), ProtocolState::Synchronized);
        let progress = a_events
            .iter()
            .filter(|ev| matches!(ev, Event::Synchronizing { .. }))
            .count();
        assert_eq!(progress, 4);
        assert_eq!(a_events.first(), Some(&Event::Connected));
        assert_eq!(a_events.last(), Some(&Event::Synchronized));
        assert_eq!(a.remote_magic, b.magic());
    }

    #[test]
    fn test_sync_reply_with_unknown_token_is_ignored() {
        let mut protocol = host(timing());
        protocol.synchronize().unwrap();
        let reply = Message {
            header: MessageHeader {
                magic: 99,
                sequence: 0,
            },
            body: MessageBody::SyncReply(SyncReply { random_reply: 12345 }),
        };
        protocol.sync_random_requests.remove(&12345);
        protocol.handle_message(&reply);
        assert_eq!(
            protocol.sync_remaining_roundtrips,
            SyncConfig::default().num_sync_packets
        );
        assert!(protocol.event_queue.is_empty());
    }

    #[test]
    fn test_sync_request_for_other_endpoint_is_ignored() {
        let mut protocol = host(timing());
        let request = Message {
            header: MessageHeader {
                magic: 7,
                sequence: 0,
            },
            body: MessageBody::SyncRequest(SyncRequest {
                random_request: 1,
                remote_magic: protocol.magic().wrapping_add(1).max(1),
            }),
        };
        protocol.handle_message(&request);
        assert!(protocol.send_queue.is_empty());
    }

    #[test]
    fn test_same_seed_same_magic() {
        let mut config = timing();
        config.protocol = ProtocolConfig::deterministic(42);
        let a = host(config);
        let b = host(config);
        assert_eq!(a.magic(), b.magic());
    }

    #[test]
    fn test_input_reaches_peer() {
        let (mut a, mut b) = synced_pair();
        let status = [ConnectionStatus::default(); 2];
        a.send_input(GameInput::new(Frame::new(0), &[7]), &status);
        a.send_input(GameInput::new(Frame::new(1), &[8]), &status);
        pump(&mut a, &mut b);

        let received: Vec<Event> = b.event_queue.drain(..).collect();
        assert_eq!(
            received,
            vec![
                Event::Input {
                    input: GameInput::new(Frame::new(0), &[7]),
                    player: PlayerHandle::new(0),
                },
                Event::Input {
                    input: GameInput::new(Frame::new(1), &[8]),
                    player: PlayerHandle::new(0),
                },
            ]
        );
        assert_eq!(b.state(), ProtocolState::Running);
    }

    #[test]
    fn test_input_ack_pops_pending_output() {
        let (mut a, mut b) = synced_pair();
        let status = [ConnectionStatus::default(); 2];
        for frame in 0..3 {
            a.send_input(GameInput::new(Frame::new(frame), &[1]), &status);
        }
        assert_eq!(a.pending_output.len(), 3);
        pump(&mut a, &mut b);
        pump(&mut b, &mut a);
        assert!(a.pending_output.is_empty());
        assert_eq!(a.last_acked_input.frame, Frame::new(2));
    }

    #[test]
    fn test_delayed_first_frame_decodes_after_resend() {
        let (mut a, mut b) = synced_pair();
        let status = [ConnectionStatus::default(); 2];
        // the first input starts late and its ack gets lost
        a.send_input(GameInput::new(Frame::new(2), &[5]), &status);
        pump(&mut a, &mut b);
        b.send_queue.clear();
        a.send_input(GameInput::new(Frame::new(3), &[6]), &status);
        pump(&mut a, &mut b);

        let frames: Vec<Frame> = b
            .event_queue
            .drain(..)
            .filter_map(|ev| match ev {
                Event::Input { input, .. } => Some(input.frame),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![Frame::new(2), Frame::new(3)]);
    }

    #[test]
    fn test_input_size_mismatch_is_rejected() {
        let (mut a, _) = synced_pair();
        let mut b = UdpProtocol::new(vec![PlayerHandle::new(0)], addr(1), 2, 2, 2, timing(), None);
        b.sync_remaining_roundtrips = 0;
        b.state = ProtocolState::Synchronized;
        b.remote_magic = a.magic();
        a.send_input(GameInput::new(Frame::new(0), &[1]), &[ConnectionStatus::default(); 2]);
        pump(&mut a, &mut b);
        assert!(b.event_queue.is_empty());
    }

    #[test]
    fn test_quality_report_queues_reply() {
        let (mut a, mut b) = synced_pair();
        a.send_quality_report();
        pump(&mut a, &mut b);
        assert!(matches!(
            b.send_queue.back().map(|msg| &msg.body),
            Some(MessageBody::QualityReply(_))
        ));
        pump(&mut b, &mut a);
        assert!(a.network_stats().ping < 1000);
    }

    #[test]
    fn test_wrong_magic_is_filtered() {
        let (_, mut b) = synced_pair();
        let msg = Message {
            header: MessageHeader {
                magic: b.remote_magic.wrapping_add(1).max(1),
                sequence: 100,
            },
            body: MessageBody::InputAck(InputAck {
                ack_frame: Frame::new(3),
            }),
        };
        let before = b.last_recv_seq;
        b.handle_message(&msg);
        assert_eq!(b.last_recv_seq, before);
    }

    #[test]
    fn test_old_sequence_is_dropped() {
        let (mut a, mut b) = synced_pair();
        a.send_keep_alive();
        let stale = a.send_queue.pop_back().unwrap();
        a.send_keep_alive();
        pump(&mut a, &mut b);
        let last = b.last_recv_seq;
        b.handle_message(&stale);
        assert_eq!(b.last_recv_seq, last);
    }

    #[test]
    fn test_pending_output_limit_disconnects() {
        let mut config = timing();
        config.protocol.pending_output_limit = 4;
        let mut a = host(config);
        a.state = ProtocolState::Running;
        for frame in 0..5 {
            a.queue_input(GameInput::new(Frame::new(frame), &[0]));
        }
        assert_eq!(a.event_queue.back(), Some(&Event::Disconnected));
    }

    #[test]
    fn test_zero_disconnect_timeout_never_disconnects() {
        let mut config = timing();
        config.disconnect_timeout = Duration::ZERO;
        config.disconnect_notify_start = Duration::from_millis(1);
        let mut a = host(config);
        a.state = ProtocolState::Running;
        a.last_recv_time = Instant::now() - Duration::from_millis(50);
        assert!(events(&mut a)
            .iter()
            .all(|ev| !matches!(ev, Event::Disconnected | Event::NetworkInterrupted { .. })));
    }

    #[test]
    fn test_interrupt_then_resume() {
        let mut config = timing();
        config.disconnect_timeout = Duration::from_millis(5000);
        config.disconnect_notify_start = Duration::from_millis(10);
        let (_, mut b) = synced_pair();
        let mut a = host(config);
        a.state = ProtocolState::Running;
        a.remote_magic = b.magic();
        a.last_recv_time = Instant::now() - Duration::from_millis(50);

        let first = events(&mut a);
        assert!(first.contains(&Event::NetworkInterrupted {
            disconnect_timeout: 4990
        }));
        assert!(!first.contains(&Event::Disconnected));

        b.send_keep_alive();
        pump(&mut b, &mut a);
        assert!(events(&mut a).contains(&Event::NetworkResumed));
    }

    #[test]
    fn test_timeout_disconnects_once() {
        let mut config = timing();
        config.disconnect_timeout = Duration::from_millis(10);
        config.disconnect_notify_start = Duration::ZERO;
        let mut a = host(config);
        a.state = ProtocolState::Synchronized;
        a.last_recv_time = Instant::now() - Duration::from_millis(50);
        assert!(events(&mut a).contains(&Event::Disconnected));
        assert!(events(&mut a).is_empty());
    }

    #[test]
    fn test_shutdown_after_delay() {
        let mut config = timing();
        config.protocol.shutdown_delay = Duration::ZERO;
        let mut a = host(config);
        a.disconnect();
        assert_eq!(a.state(), ProtocolState::Disconnected);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let _ = events(&mut a);
        assert_eq!(a.state(), ProtocolState::Shutdown);
        a.send_keep_alive();
        let network = crate::LoopbackNetwork::new();
        let mut socket = network.socket(addr(1));
        a.send_all_messages(&mut socket);
        assert!(a.send_queue.is_empty());
        assert_eq!(network.pending(&addr(2)), 0);
    }

    #[test]
    fn test_connect_status_is_merged() {
        let (mut a, mut b) = synced_pair();
        let status = [
            ConnectionStatus {
                disconnected: false,
                last_frame: Frame::new(0),
            },
            ConnectionStatus {
                disconnected: true,
                last_frame: Frame::new(4),
            },
        ];
        a.send_input(GameInput::new(Frame::new(0), &[1]), &status);
        pump(&mut a, &mut b);
        let merged = b.peer_connect_status(PlayerHandle::new(1));
        assert!(merged.disconnected);
        assert_eq!(merged.last_frame, Frame::new(4));
    }

    /// Forces the running-retry timer of `protocol` to fire on the next poll.
    fn retry_now(protocol: &mut UdpProtocol) {
        protocol.running_last_input_recv =
            Instant::now() - protocol.sync_config.running_retry_interval * 2;
    }

    #[test]
    fn test_connect_status_refreshes_after_everything_is_acked() {
        let (mut a, mut b) = synced_pair();
        let stale = [ConnectionStatus::default(); 2];
        b.send_input(GameInput::new(Frame::new(0), &[3]), &stale);
        pump(&mut b, &mut a);
        pump(&mut a, &mut b);
        assert!(b.pending_output.is_empty());
        assert_eq!(a.peer_connect_status(PlayerHandle::new(0)).last_frame, Frame::NULL);
        a.event_queue.clear();

        // b learned about player 0's frame 0 but has no input of its own to send
        let fresh = [
            ConnectionStatus {
                disconnected: false,
                last_frame: Frame::new(0),
            },
            ConnectionStatus {
                disconnected: false,
                last_frame: Frame::new(0),
            },
        ];
        retry_now(&mut b);
        let _ = b.poll(&fresh).count();
        assert!(b
            .send_queue
            .iter()
            .any(|msg| matches!(&msg.body, MessageBody::Input(body) if body.bytes.is_empty())));
        pump(&mut b, &mut a);

        assert_eq!(
            a.peer_connect_status(PlayerHandle::new(0)).last_frame,
            Frame::new(0)
        );
        assert!(!a
            .event_queue
            .iter()
            .any(|ev| matches!(ev, Event::Input { .. })));
        assert_eq!(a.last_recv_frame, Frame::new(0));
    }

    #[test]
    fn test_empty_input_carries_lost_ack() {
        let (mut a, mut b) = synced_pair();
        let status = [ConnectionStatus::default(); 2];
        a.send_input(GameInput::new(Frame::new(0), &[1]), &status);
        pump(&mut a, &mut b);
        // the ack of b is lost
        b.send_queue.clear();
        assert_eq!(a.pending_output.len(), 1);

        retry_now(&mut b);
        let _ = b.poll(&status).count();
        pump(&mut b, &mut a);
        assert!(a.pending_output.is_empty());
        assert_eq!(a.last_acked_input.frame, Frame::new(0));
    }

    #[test]
    fn test_empty_input_does_not_start_running() {
        let (mut a, mut b) = synced_pair();
        retry_now(&mut a);
        let _ = a.poll(&[ConnectionStatus::default(); 2]).count();
        pump(&mut a, &mut b);
        assert_eq!(b.state(), ProtocolState::Synchronized);
        assert!(b.event_queue.is_empty());
    }

    #[test]
    fn test_frame_advantage_estimate() {
        let (mut a, mut b) = synced_pair();
        let status = [ConnectionStatus::default(); 2];
        for frame in 0..10 {
            a.send_input(GameInput::new(Frame::new(frame), &[0]), &status);
        }
        pump(&mut a, &mut b);
        b.update_local_frame_advantage(Frame::new(4));
        assert_eq!(b.network_stats().local_frames_behind, 5);
        assert_eq!(b.network_stats().recv_queue_len, 5);
    }
}
