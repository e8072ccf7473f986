//! Player registry for tracking players and their protocol endpoints.
//!
//! Players are registered one by one through `add_player`. Remote endpoints are only created
//! once every player slot is filled, because an endpoint must know all players living on its
//! peer before it can split incoming input.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::network::protocol::UdpProtocol;
use crate::{PlayerHandle, PlayerType};

/// Registry tracking all players and their connection endpoints.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
#[derive(Default)]
pub struct PlayerRegistry {
    /// Map from player handles to their types.
    pub(crate) handles: BTreeMap<PlayerHandle, PlayerType>,
    /// Map from addresses to protocol handlers for remote players.
    pub(crate) remotes: BTreeMap<SocketAddr, UdpProtocol>,
    /// Map from addresses to protocol handlers for spectators.
    pub(crate) spectators: BTreeMap<SocketAddr, UdpProtocol>,
}

impl std::fmt::Debug for PlayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            handles,
            remotes,
            spectators,
        } = self;

        f.debug_struct("PlayerRegistry")
            .field("handles", handles)
            .field("remotes", &remotes.keys())
            .field("spectators", &spectators.keys())
            .finish()
    }
}

impl PlayerRegistry {
    /// Creates a new empty player registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The type of the participant behind `handle`.
    #[must_use]
    pub fn player_type(&self, handle: PlayerHandle) -> Option<PlayerType> {
        self.handles.get(&handle).copied()
    }

    /// Iterates over local player handles in ascending order.
    pub fn local_player_handles(&self) -> impl Iterator<Item = PlayerHandle> + '_ {
        self.handles
            .iter()
            .filter_map(|(k, v)| matches!(v, PlayerType::Local).then_some(*k))
    }

    /// Iterates over remote player handles in ascending order.
    pub fn remote_player_handles(&self) -> impl Iterator<Item = PlayerHandle> + '_ {
        self.handles
            .iter()
            .filter_map(|(k, v)| matches!(v, PlayerType::Remote(_)).then_some(*k))
    }

    /// Number of players (local and remote) registered so far.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.handles
            .values()
            .filter(|v| !matches!(v, PlayerType::Spectator(_)))
            .count()
    }

    /// Number of local players.
    #[must_use]
    pub fn num_local_players(&self) -> usize {
        self.local_player_handles().count()
    }

    /// Number of spectators registered so far.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.handles
            .values()
            .filter(|v| matches!(v, PlayerType::Spectator(_)))
            .count()
    }

    /// Remote player handles grouped by the address of the peer they live on.
    #[must_use]
    pub fn remote_handles_by_address(&self) -> BTreeMap<SocketAddr, Vec<PlayerHandle>> {
        let mut by_addr: BTreeMap<SocketAddr, Vec<PlayerHandle>> = BTreeMap::new();
        for (handle, player_type) in &self.handles {
            if let PlayerType::Remote(addr) = player_type {
                by_addr.entry(*addr).or_default().push(*handle);
            }
        }
        by_addr
    }

    /// The handle of the spectator at `addr`.
    #[must_use]
    pub fn spectator_handle(&self, addr: &SocketAddr) -> Option<PlayerHandle> {
        self.handles.iter().find_map(|(handle, player_type)| {
            matches!(player_type, PlayerType::Spectator(a) if a == addr).then_some(*handle)
        })
    }

    /// The address of the peer `handle` lives on, for remote players and spectators.
    #[must_use]
    pub fn address_of(&self, handle: PlayerHandle) -> Option<SocketAddr> {
        match self.handles.get(&handle)? {
            PlayerType::Local => None,
            PlayerType::Remote(addr) | PlayerType::Spectator(addr) => Some(*addr),
        }
    }

    /// `true` once every endpoint that exists has finished its handshake.
    #[must_use]
    pub fn all_synchronized(&self) -> bool {
        self.remotes
            .values()
            .chain(self.spectators.values())
            .all(UdpProtocol::is_synchronized)
    }
}
