//! Spectator session integration tests.

use std::thread;
use std::time::Duration;

use crate::common::stubs::{baseline, GameStub};
use crate::common::{poll_with_sleep, synchronize_sessions, test_addr};
use rollback_netcode::{
    Event, InputStatus, LoopbackNetwork, NetcodeError, P2PSession, Player, PlayerHandle, Session,
    SessionBuilder, SpectatorSession,
};

const HOST_PORT: u16 = 1;
const SPECTATOR_PORT: u16 = 9;

fn input_of(frame: i32, player: i32) -> u8 {
    (frame * 2 + player) as u8
}

/// A host with two local players and one spectator, both running.
fn host_and_spectator() -> (P2PSession, GameStub, SpectatorSession, GameStub) {
    let network = LoopbackNetwork::new();
    let host_game = GameStub::new();
    let spectator_game = GameStub::new();
    let mut host = SessionBuilder::new(2, 1)
        .start_p2p_session(host_game.clone(), network.socket(test_addr(HOST_PORT)))
        .unwrap();
    host.add_player(Player::local(1)).unwrap();
    host.add_player(Player::local(2)).unwrap();
    host.add_player(Player::spectator(test_addr(SPECTATOR_PORT)))
        .unwrap();
    let mut spectator = SessionBuilder::new(2, 1)
        .start_spectator_session(
            test_addr(HOST_PORT),
            spectator_game.clone(),
            network.socket(test_addr(SPECTATOR_PORT)),
        )
        .unwrap();
    synchronize_sessions(&mut [&mut host, &mut spectator]).unwrap();
    (host, host_game, spectator, spectator_game)
}

fn run_host_frame(host: &mut P2PSession, game: &GameStub, frame: i32) {
    host.add_local_input(PlayerHandle::new(0), &[input_of(frame, 0)])
        .unwrap();
    host.add_local_input(PlayerHandle::new(1), &[input_of(frame, 1)])
        .unwrap();
    let inputs = host.synchronize_input().unwrap();
    game.advance(&inputs);
    host.advance_frame().unwrap();
}

/// Consumes every frame the spectator has and returns how many there were.
fn drain_spectator(spectator: &mut SpectatorSession, game: &GameStub) -> i32 {
    let mut frames = 0;
    loop {
        match spectator.synchronize_input() {
            Ok(inputs) => {
                assert_eq!(inputs.status(0), Some(InputStatus::Confirmed));
                assert_eq!(inputs.status(1), Some(InputStatus::Confirmed));
                game.advance(&inputs);
                spectator.advance_frame().unwrap();
                frames += 1;
            },
            Err(NetcodeError::PredictionThreshold) => return frames,
            Err(err) => panic!("spectator failed: {err}"),
        }
    }
}

#[test]
fn test_spectator_host_waits_for_spectator_handshake() {
    let network = LoopbackNetwork::new();
    let mut host = SessionBuilder::new(1, 1)
        .start_p2p_session(GameStub::new(), network.socket(test_addr(HOST_PORT)))
        .unwrap();
    host.add_player(Player::local(1)).unwrap();
    host.add_player(Player::spectator(test_addr(SPECTATOR_PORT)))
        .unwrap();
    // nobody answers on the spectator port
    poll_with_sleep(&mut [&mut host], 10);
    assert_eq!(
        host.add_local_input(PlayerHandle::new(0), &[1]),
        Err(NetcodeError::NotSynchronized)
    );
    assert_eq!(host.num_spectators(), 1);
}

#[test]
fn test_spectator_simulates_the_same_game_as_the_host() {
    let (mut host, host_game, mut spectator, spectator_game) = host_and_spectator();
    let mut consumed = 0;
    for frame in 0..40 {
        run_host_frame(&mut host, &host_game, frame);
        spectator.idle(0).unwrap();
        consumed += drain_spectator(&mut spectator, &spectator_game);
    }
    poll_with_sleep(&mut [&mut host, &mut spectator], 5);
    consumed += drain_spectator(&mut spectator, &spectator_game);

    assert_eq!(consumed, 40);
    assert_eq!(spectator.current_frame().as_i32(), 40);
    assert_eq!(spectator.frames_behind_host(), 0);
    assert_eq!(spectator_game.state(), host_game.state());
    assert_eq!(
        spectator_game.state(),
        baseline(40, |frame| vec![vec![input_of(frame, 0)], vec![input_of(frame, 1)]])
    );
    // spectators never roll back
    assert_eq!(spectator_game.loads(), 0);
    assert_eq!(spectator_game.saves(), 0);
}

#[test]
fn test_spectator_catches_up_after_falling_behind() {
    let (mut host, host_game, mut spectator, spectator_game) = host_and_spectator();
    for frame in 0..20 {
        run_host_frame(&mut host, &host_game, frame);
        spectator.idle(0).unwrap();
    }
    poll_with_sleep(&mut [&mut host, &mut spectator], 5);

    assert_eq!(spectator.frames_behind_host(), 20);
    assert_eq!(drain_spectator(&mut spectator, &spectator_game), 20);
    assert_eq!(spectator.frames_behind_host(), 0);
    assert_eq!(spectator_game.state(), host_game.state());
}

#[test]
fn test_spectator_reports_silent_host() {
    let (mut host, _host_game, mut spectator, spectator_game) = host_and_spectator();
    spectator.set_disconnect_notify_start(50).unwrap();
    spectator.set_disconnect_timeout(150).unwrap();
    host.close().unwrap();

    for _ in 0..100 {
        spectator.idle(0).unwrap();
        thread::sleep(Duration::from_millis(5));
    }

    let host_handle = PlayerHandle::new(0);
    let events = spectator_game.events();
    assert!(events.iter().any(|event| matches!(
        event,
        Event::ConnectionInterrupted { player, .. } if *player == host_handle
    )));
    assert!(events.contains(&Event::DisconnectedFromPeer {
        player: host_handle
    }));
}

#[test]
fn test_spectator_stats_are_for_the_host_only() {
    let (_host, _host_game, spectator, _spectator_game) = host_and_spectator();
    assert!(spectator.network_stats(PlayerHandle::new(0)).is_ok());
    assert_eq!(
        spectator.network_stats(PlayerHandle::new(1)),
        Err(NetcodeError::InvalidPlayerHandle {
            handle: PlayerHandle::new(1)
        })
    );
}
