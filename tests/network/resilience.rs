//! Network resilience tests using `ChaosSocket`.
//!
//! Latency is applied on the receiving side, so wrapping only one peer's socket delays
//! everything that peer hears while its own packets still arrive immediately.

use std::thread;
use std::time::{Duration, Instant};

use crate::common::stubs::{baseline, GameStub};
use crate::common::{advance_with_retry, poll_with_sleep, synchronize_sessions, test_addr};
use rollback_netcode::{
    ChaosConfig, ChaosSocket, Event, LoopbackNetwork, NonBlockingSocket, P2PSession, Player,
    PlayerHandle, Session, SessionBuilder, SessionState, SyncConfig,
};

const P1: PlayerHandle = PlayerHandle::new(0);
const P2: PlayerHandle = PlayerHandle::new(1);
const P3: PlayerHandle = PlayerHandle::new(2);

fn start_pair(
    builder: impl Fn() -> SessionBuilder,
    socket_a: impl NonBlockingSocket + 'static,
    socket_b: impl NonBlockingSocket + 'static,
) -> (P2PSession, GameStub, P2PSession, GameStub) {
    let game_a = GameStub::new();
    let game_b = GameStub::new();
    let mut a = builder().start_p2p_session(game_a.clone(), socket_a).unwrap();
    let mut b = builder().start_p2p_session(game_b.clone(), socket_b).unwrap();
    a.add_player(Player::local(1)).unwrap();
    a.add_player(Player::remote(2, test_addr(2))).unwrap();
    b.add_player(Player::remote(1, test_addr(1))).unwrap();
    b.add_player(Player::local(2)).unwrap();
    synchronize_sessions(&mut [&mut a, &mut b]).unwrap();
    (a, game_a, b, game_b)
}

fn lan_builder() -> SessionBuilder {
    SessionBuilder::new(2, 1).with_sync_config(SyncConfig::lan())
}

/// Polls upper bound for the inputs of the last frame to be confirmed on both peers. Lost
/// packets are resent every running retry interval.
const MAX_DRAIN_POLLS: usize = 3000;

/// Idles both peers until each has confirmed `frame`, so every rollback has been replayed.
#[track_caller]
fn drain_until_confirmed(a: &mut P2PSession, b: &mut P2PSession, frame: i32) {
    for _ in 0..MAX_DRAIN_POLLS {
        if a.confirmed_frame().as_i32() >= frame && b.confirmed_frame().as_i32() >= frame {
            return;
        }
        poll_with_sleep(&mut [&mut *a, &mut *b], 1);
    }
    panic!(
        "confirmed frames {} and {} never reached {frame}",
        a.confirmed_frame(),
        b.confirmed_frame()
    );
}

#[test]
fn test_constant_inputs_over_latency_roll_back_once() {
    let network = LoopbackNetwork::new();
    let chaos = ChaosConfig::builder()
        .latency_ms(50)
        .drop_nth_send(30)
        .seed(7)
        .build();
    let (mut a, game_a, mut b, game_b) = start_pair(
        lan_builder,
        ChaosSocket::new(network.socket(test_addr(1)), chaos),
        network.socket(test_addr(2)),
    );

    let frames = 60;
    for _ in 0..frames {
        advance_with_retry(&mut a, &mut [&mut b], &game_a, P1, &[0]);
        advance_with_retry(&mut b, &mut [&mut a], &game_b, P2, &[1]);
    }
    // let the last inputs cross the delayed link
    drain_until_confirmed(&mut a, &mut b, frames - 1);

    // only the blank prediction of player 2's very first input is wrong
    assert_eq!(game_a.loads(), 1);
    // player 1 sends exactly the blank input player 2 predicts
    assert_eq!(game_b.loads(), 0);

    let expected = baseline(frames, |_| vec![vec![0], vec![1]]);
    assert_eq!(game_a.state(), expected);
    assert_eq!(game_b.state(), expected);
}

#[test]
fn test_changing_inputs_converge_under_jitter_and_loss() {
    let network = LoopbackNetwork::new();
    let chaos = |seed| {
        ChaosConfig::builder()
            .latency_ms(10)
            .jitter(Duration::from_millis(5))
            .packet_loss_rate(0.1)
            .seed(seed)
            .build()
    };
    let builder = || {
        lan_builder()
            .with_disconnect_timeout(Duration::from_secs(10))
            .with_disconnect_notify_start(Duration::from_secs(5))
    };
    let (mut a, game_a, mut b, game_b) = start_pair(
        builder,
        ChaosSocket::new(network.socket(test_addr(1)), chaos(1)),
        ChaosSocket::new(network.socket(test_addr(2)), chaos(2)),
    );

    let input_of = |frame: i32, player: i32| ((frame / 4 + player) % 3) as u8;
    let frames = 40;
    for frame in 0..frames {
        advance_with_retry(&mut a, &mut [&mut b], &game_a, P1, &[input_of(frame, 0)]);
        advance_with_retry(&mut b, &mut [&mut a], &game_b, P2, &[input_of(frame, 1)]);
    }
    drain_until_confirmed(&mut a, &mut b, frames - 1);

    let expected = baseline(frames, |frame| {
        vec![vec![input_of(frame, 0)], vec![input_of(frame, 1)]]
    });
    assert_eq!(game_a.state(), expected);
    assert_eq!(game_b.state(), expected);
    for game in [&game_a, &game_b] {
        assert!(!game
            .events()
            .iter()
            .any(|event| matches!(event, Event::DisconnectedFromPeer { .. })));
    }
}

#[test]
fn test_silent_peer_is_disconnected_after_timeout() {
    let network = LoopbackNetwork::new();
    let builder = || {
        lan_builder()
            .with_disconnect_timeout(Duration::from_millis(150))
            .with_disconnect_notify_start(Duration::from_millis(50))
    };
    let (mut a, game_a, _b, _game_b) = start_pair(
        builder,
        network.socket(test_addr(1)),
        network.socket(test_addr(2)),
    );

    // player 2 stops polling
    for _ in 0..100 {
        a.idle(0).unwrap();
        thread::sleep(Duration::from_millis(5));
    }

    let events = game_a.events();
    let interrupted = events
        .iter()
        .position(|event| matches!(event, Event::ConnectionInterrupted { player, .. } if *player == P2));
    let disconnected = events
        .iter()
        .position(|event| *event == Event::DisconnectedFromPeer { player: P2 });
    assert!(interrupted.is_some(), "{events:?}");
    assert!(disconnected.is_some(), "{events:?}");
    assert!(interrupted < disconnected);
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, Event::DisconnectedFromPeer { .. }))
            .count(),
        1
    );

    // the game goes on without player 2
    a.add_local_input(P1, &[3]).unwrap();
    let inputs = a.synchronize_input().unwrap();
    assert!(inputs.is_disconnected(1));
    assert_eq!(a.current_state(), SessionState::Running);
}

#[test]
fn test_disconnect_spreads_through_connect_status() {
    let network = LoopbackNetwork::new();
    let players: u16 = 3;
    let mut sessions = Vec::new();
    let mut games = Vec::new();
    for local in 1..=players {
        let mut builder = SessionBuilder::new(3, 1).with_sync_config(SyncConfig::lan());
        if local == 2 {
            builder = builder
                .with_disconnect_timeout(Duration::from_millis(200))
                .with_disconnect_notify_start(Duration::from_millis(100));
        }
        let game = GameStub::new();
        let mut session = builder
            .start_p2p_session(game.clone(), network.socket(test_addr(local)))
            .unwrap();
        for number in 1..=players {
            let player = if number == local {
                Player::local(usize::from(number))
            } else {
                Player::remote(usize::from(number), test_addr(number))
            };
            session.add_player(player).unwrap();
        }
        sessions.push(session);
        games.push(game);
    }
    let mut c = sessions.pop().unwrap();
    let mut b = sessions.pop().unwrap();
    let mut a = sessions.pop().unwrap();
    let (game_a, game_b, game_c) = (&games[0], &games[1], &games[2]);
    synchronize_sessions(&mut [&mut a, &mut b, &mut c]).unwrap();

    for _ in 0..10 {
        advance_with_retry(&mut a, &mut [&mut b, &mut c], game_a, P1, &[1]);
        advance_with_retry(&mut b, &mut [&mut a, &mut c], game_b, P2, &[2]);
        advance_with_retry(&mut c, &mut [&mut a, &mut b], game_c, P3, &[3]);
    }

    // player 1 goes silent; only player 2 times out on them
    c.add_local_input(P3, &[3]).unwrap();
    let mut learned = false;
    for _ in 0..400 {
        b.idle(0).unwrap();
        c.idle(0).unwrap();
        if game_b.events().contains(&Event::DisconnectedFromPeer { player: P1 }) {
            let inputs = c.synchronize_input().unwrap();
            if inputs.is_disconnected(0) {
                learned = true;
                break;
            }
        }
        thread::sleep(Duration::from_millis(2));
    }

    assert!(learned, "{:?}", game_c.events());
    assert!(!game_c
        .events()
        .iter()
        .any(|event| matches!(event, Event::DisconnectedFromPeer { .. })));
    let inputs = c.synchronize_input().unwrap();
    assert!(!inputs.is_disconnected(1));
    assert_eq!(inputs.player(0), Some(&[0][..]));
}

#[test]
fn test_zero_disconnect_timeout_never_gives_up() {
    let network = LoopbackNetwork::new();
    let builder = || {
        lan_builder()
            .with_disconnect_timeout(Duration::ZERO)
            .with_disconnect_notify_start(Duration::from_millis(20))
    };
    let (mut a, game_a, _b, _game_b) = start_pair(
        builder,
        network.socket(test_addr(1)),
        network.socket(test_addr(2)),
    );

    for _ in 0..60 {
        a.idle(0).unwrap();
        thread::sleep(Duration::from_millis(5));
    }

    assert!(!game_a.events().iter().any(|event| matches!(
        event,
        Event::DisconnectedFromPeer { .. } | Event::ConnectionInterrupted { .. }
    )));
}

#[test]
fn test_interrupted_peer_resumes() {
    let network = LoopbackNetwork::new();
    let builder = || {
        lan_builder()
            .with_disconnect_timeout(Duration::from_secs(5))
            .with_disconnect_notify_start(Duration::from_millis(50))
    };
    let (mut a, game_a, mut b, _game_b) = start_pair(
        builder,
        network.socket(test_addr(1)),
        network.socket(test_addr(2)),
    );

    for _ in 0..30 {
        a.idle(0).unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    // player 2 comes back and talks again
    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        poll_with_sleep(&mut [&mut a, &mut b], 1);
    }

    let events = game_a.events();
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::ConnectionInterrupted { player, .. } if *player == P2)));
    assert!(events.contains(&Event::ConnectionResumed { player: P2 }));
    assert!(!events
        .iter()
        .any(|event| matches!(event, Event::DisconnectedFromPeer { .. })));
}
