//! In-memory datagram network for running several sessions in one process.
//!
//! Every [`LoopbackSocket`] created from the same [`LoopbackNetwork`] can reach every other by
//! its address. Delivery is instant, lossless and ordered; wrap a socket in a
//! [`ChaosSocket`](crate::ChaosSocket) to make it less friendly.
//!
//! ```
//! use rollback_netcode::{LoopbackNetwork, NonBlockingSocket};
//!
//! let network = LoopbackNetwork::new();
//! let a = network.socket("127.0.0.1:7000".parse().unwrap());
//! let mut b = network.socket("127.0.0.1:7001".parse().unwrap());
//! assert!(b.receive_all_messages().is_empty());
//! # drop(a);
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::network::messages::Message;
use crate::NonBlockingSocket;

type Mailboxes = HashMap<SocketAddr, VecDeque<(SocketAddr, Message)>>;

/// A shared hub routing messages between [`LoopbackSocket`]s.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    mailboxes: Arc<Mutex<Mailboxes>>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a socket listening on `addr`. A second socket on the same address shares the
    /// mailbox of the first.
    #[must_use]
    pub fn socket(&self, addr: SocketAddr) -> LoopbackSocket {
        self.mailboxes.lock().entry(addr).or_default();
        LoopbackSocket {
            addr,
            mailboxes: Arc::clone(&self.mailboxes),
        }
    }

    /// Number of messages waiting for `addr`.
    #[must_use]
    pub fn pending(&self, addr: &SocketAddr) -> usize {
        self.mailboxes.lock().get(addr).map_or(0, VecDeque::len)
    }
}

/// One endpoint of a [`LoopbackNetwork`].
#[derive(Debug, Clone)]
pub struct LoopbackSocket {
    addr: SocketAddr,
    mailboxes: Arc<Mutex<Mailboxes>>,
}

impl LoopbackSocket {
    /// The address this socket receives on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl NonBlockingSocket for LoopbackSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        let mut mailboxes = self.mailboxes.lock();
        match mailboxes.get_mut(addr) {
            Some(mailbox) => mailbox.push_back((self.addr, msg.clone())),
            // nobody listens there, the datagram is lost
            None => tracing::trace!(to = %addr, kind = msg.kind(), "loopback send to unknown address"),
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        self.mailboxes
            .lock()
            .get_mut(&self.addr)
            .map(|mailbox| mailbox.drain(..).collect())
            .unwrap_or_default()
    }
}
