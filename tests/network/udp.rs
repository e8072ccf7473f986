//! P2P sessions over real UDP sockets on localhost.

use crate::common::stubs::{baseline, GameStub};
use crate::common::{
    advance_with_retry, poll_with_sleep, synchronize_sessions, test_addr, PortAllocator,
};
use rollback_netcode::{
    start_session, NetcodeError, Player, PlayerHandle, Session, SessionBuilder, SyncConfig,
};
use serial_test::serial;

#[test]
#[serial]
fn test_udp_pair_plays_a_game() {
    let (port_a, port_b) = PortAllocator::next_pair();
    let game_a = GameStub::new();
    let game_b = GameStub::new();
    let mut a = SessionBuilder::new(2, 1)
        .with_sync_config(SyncConfig::lan())
        .with_local_port(port_a)
        .start_udp_session(game_a.clone(), "udp")
        .unwrap();
    let mut b = SessionBuilder::new(2, 1)
        .with_sync_config(SyncConfig::lan())
        .with_local_port(port_b)
        .start_udp_session(game_b.clone(), "udp")
        .unwrap();
    a.add_player(Player::local(1)).unwrap();
    a.add_player(Player::remote(2, test_addr(port_b))).unwrap();
    b.add_player(Player::remote(1, test_addr(port_a))).unwrap();
    b.add_player(Player::local(2)).unwrap();
    synchronize_sessions(&mut [&mut a, &mut b]).unwrap();

    let input_of = |frame: i32, player: i32| ((frame + player * 3) % 11) as u8;
    let frames = 30;
    for frame in 0..frames {
        advance_with_retry(
            &mut a,
            &mut [&mut b],
            &game_a,
            PlayerHandle::new(0),
            &[input_of(frame, 0)],
        );
        advance_with_retry(
            &mut b,
            &mut [&mut a],
            &game_b,
            PlayerHandle::new(1),
            &[input_of(frame, 1)],
        );
    }
    poll_with_sleep(&mut [&mut a, &mut b], 50);

    let expected = baseline(frames, |frame| {
        vec![vec![input_of(frame, 0)], vec![input_of(frame, 1)]]
    });
    assert_eq!(game_a.state(), expected);
    assert_eq!(game_b.state(), expected);
    assert!(a.network_stats(PlayerHandle::new(1)).is_ok());
}

#[test]
#[serial]
fn test_udp_session_needs_a_free_port() {
    let port = PortAllocator::next_port();
    let _first = start_session(GameStub::new(), "udp", 2, 1, port).unwrap();
    let second = start_session(GameStub::new(), "udp", 2, 1, port);
    assert!(matches!(second, Err(NetcodeError::Socket { .. })));
}

#[test]
fn test_udp_session_needs_a_local_port() {
    let result = SessionBuilder::new(2, 1).start_udp_session(GameStub::new(), "udp");
    assert!(matches!(result, Err(NetcodeError::InvalidRequest { .. })));
}
