use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use crate::network::codec::{self, MAX_DATAGRAM_SIZE};
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{network::messages::Message, NonBlockingSocket};

/// A packet larger than this may be fragmented, so ideally we wouldn't send packets larger than
/// this.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A simple non-blocking UDP socket to use with sessions. Listens to 0.0.0.0 on a given port.
///
/// Datagrams that fail to decode are dropped and reported as a protocol violation.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    recv_buffer: Vec<u8>,
}

impl UdpNonBlockingSocket {
    /// Binds an UDP Socket to 0.0.0.0:port and set it to non-blocking mode.
    ///
    /// # Errors
    /// Returns the [`std::io::Error`] of a failed bind or mode switch.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            recv_buffer: vec![0; MAX_DATAGRAM_SIZE],
        })
    }

    /// The address the socket is bound to.
    ///
    /// # Errors
    /// Forwards the error of [`UdpSocket::local_addr`].
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }
}

impl NonBlockingSocket for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        let buf = match codec::encode_message(msg) {
            Ok(buf) => buf,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Failed to serialize {} message: {}",
                    msg.kind(),
                    e
                );
                return;
            },
        };

        if buf.len() > MAX_DATAGRAM_SIZE {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "Dropping {} byte datagram, larger than the {} byte limit",
                buf.len(),
                MAX_DATAGRAM_SIZE
            );
            return;
        }

        // Fragmented datagrams are lost whenever a single fragment is lost. Large packets almost
        // always mean an oversized input struct, so let the host know.
        if buf.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Sending UDP packet of size {} bytes, which is larger than ideal ({})",
                buf.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }

        // UDP is best-effort, a failed send is just a lost packet
        if let Err(e) = self.socket.send_to(&buf, addr) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Failed to send UDP packet to {}: {}",
                addr,
                e
            );
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut received_messages = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((number_of_bytes, src_addr)) => {
                    let Some(datagram) = self.recv_buffer.get(..number_of_bytes) else {
                        continue;
                    };
                    match codec::decode_message(datagram) {
                        Ok(msg) => received_messages.push((src_addr, msg)),
                        Err(e) => {
                            report_violation!(
                                ViolationSeverity::Warning,
                                ViolationKind::NetworkProtocol,
                                "Dropping malformed datagram of {} bytes from {}: {}",
                                number_of_bytes,
                                src_addr,
                                e
                            );
                        },
                    }
                },
                // there are no more messages
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received_messages,
                // datagram socket sometimes get this error as a result of calling the send_to method
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Unexpected socket error: {:?}: {}",
                        err.kind(),
                        err
                    );
                    return received_messages;
                },
            }
        }
    }
}
