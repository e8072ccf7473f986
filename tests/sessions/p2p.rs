//! P2P session integration tests over the in-memory loopback network.

use crate::common::stubs::{baseline, GameStub};
use std::thread;
use std::time::Duration;

use crate::common::{advance_with_retry, poll_with_sleep, synchronize_sessions, test_addr};
use rollback_netcode::{
    Event, InputStatus, LoopbackNetwork, NetcodeError, P2PSession, Player, PlayerHandle,
    ProtocolConfig, Session, SessionBuilder, SessionState, SyncConfig,
};

const P1: PlayerHandle = PlayerHandle::new(0);
const P2: PlayerHandle = PlayerHandle::new(1);

fn input_of_a(frame: i32) -> u8 {
    (frame % 3) as u8
}

fn input_of_b(frame: i32) -> u8 {
    (frame % 5 + 10) as u8
}

/// Player 1 lives on port 1, player 2 on port 2.
fn start_pair(builder: impl Fn() -> SessionBuilder) -> (P2PSession, GameStub, P2PSession, GameStub) {
    let network = LoopbackNetwork::new();
    let game_a = GameStub::new();
    let game_b = GameStub::new();
    let mut a = builder()
        .start_p2p_session(game_a.clone(), network.socket(test_addr(1)))
        .unwrap();
    let mut b = builder()
        .start_p2p_session(game_b.clone(), network.socket(test_addr(2)))
        .unwrap();
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

/// Runs `frames` frames on both peers, alternating between them.
fn run_pair(
    a: &mut P2PSession,
    game_a: &GameStub,
    b: &mut P2PSession,
    game_b: &GameStub,
    frames: i32,
) {
    for frame in 0..frames {
        advance_with_retry(a, &mut [&mut *b], game_a, P1, &[input_of_a(frame)]);
        advance_with_retry(b, &mut [&mut *a], game_b, P2, &[input_of_b(frame)]);
    }
    poll_with_sleep(&mut [&mut *a, &mut *b], 20);
}

#[test]
fn test_two_local_players_never_roll_back() {
    let network = LoopbackNetwork::new();
    let game = GameStub::new();
    let mut session = SessionBuilder::new(2, 1)
        .start_p2p_session(game.clone(), network.socket(test_addr(1)))
        .unwrap();
    session.add_player(Player::local(1)).unwrap();
    session.add_player(Player::local(2)).unwrap();
    session.idle(0).unwrap();
    assert_eq!(session.current_state(), SessionState::Running);

    for frame in 0..100 {
        session.add_local_input(P1, &[input_of_a(frame)]).unwrap();
        session.add_local_input(P2, &[input_of_b(frame)]).unwrap();
        let inputs = session.synchronize_input().unwrap();
        assert_eq!(inputs.status(0), Some(InputStatus::Confirmed));
        assert_eq!(inputs.status(1), Some(InputStatus::Confirmed));
        game.advance(&inputs);
        session.advance_frame().unwrap();
    }

    assert_eq!(session.current_frame().as_i32(), 100);
    assert_eq!(game.loads(), 0);
    assert_eq!(game.saves(), 101);
    assert_eq!(
        game.state(),
        baseline(100, |frame| vec![vec![input_of_a(frame)], vec![input_of_b(frame)]])
    );

    session.close().unwrap();
    assert_eq!(game.freed(), game.saves());
}

#[test]
fn test_pair_reports_handshake_events() {
    let (_a, game_a, _b, game_b) = start_pair(lan_builder);
    for game in [game_a, game_b] {
        let events = game.events();
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::ConnectedToPeer { .. })));
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::SynchronizingWithPeer { total: 3, .. })));
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::SynchronizedWithPeer { .. })));
        assert_eq!(events.iter().filter(|event| **event == Event::Running).count(), 1);
    }
}

#[test]
fn test_pair_converges_after_rollbacks() {
    let (mut a, game_a, mut b, game_b) = start_pair(lan_builder);
    run_pair(&mut a, &game_a, &mut b, &game_b, 50);

    let expected = baseline(50, |frame| vec![vec![input_of_a(frame)], vec![input_of_b(frame)]]);
    assert_eq!(game_a.state(), expected);
    assert_eq!(game_b.state(), expected);
    // player 1 always predicts player 2 before their input arrives
    assert!(game_a.loads() > 0);
    assert!(game_a.replayed() > 0);
    for session in [&a, &b] {
        let confirmed = session.confirmed_frame().as_i32();
        assert!((42..=49).contains(&confirmed), "confirmed frame {confirmed}");
    }
}

#[test]
fn test_input_delay_applies_to_both_peers() {
    let builder = || lan_builder().with_input_delay(2).unwrap();
    let (mut a, game_a, mut b, game_b) = start_pair(builder);
    assert_eq!(a.frame_delay(), 2);
    run_pair(&mut a, &game_a, &mut b, &game_b, 30);

    let expected = baseline(30, |frame| {
        if frame < 2 {
            vec![vec![0], vec![0]]
        } else {
            vec![vec![input_of_a(frame - 2)], vec![input_of_b(frame - 2)]]
        }
    });
    assert_eq!(game_a.state(), expected);
    assert_eq!(game_b.state(), expected);
}

#[test]
fn test_session_refuses_input_past_prediction_window() {
    let (mut a, game_a, _b, _game_b) = start_pair(lan_builder);
    let mut frames = 0;
    loop {
        match a.add_local_input(P1, &[1]) {
            Ok(()) => {
                let inputs = a.synchronize_input().unwrap();
                assert_eq!(inputs.status(1), Some(InputStatus::Predicted));
                game_a.advance(&inputs);
                a.advance_frame().unwrap();
                frames += 1;
            },
            Err(err) => {
                assert_eq!(err, NetcodeError::InputDropped);
                break;
            },
        }
    }
    // nothing is confirmed, so frames 0 to 6 fit into the window
    assert_eq!(frames, 7);
    assert_eq!(a.synchronize_input(), Err(NetcodeError::PredictionThreshold));
}

#[test]
fn test_disconnected_player_is_zeroed_for_the_rest_of_the_game() {
    let (mut a, game_a, mut b, game_b) = start_pair(lan_builder);
    run_pair(&mut a, &game_a, &mut b, &game_b, 10);

    a.disconnect_player(P2).unwrap();
    assert_eq!(
        a.disconnect_player(P2),
        Err(NetcodeError::PlayerDisconnected { handle: P2 })
    );

    // without player 2 the prediction window never fills up
    for _ in 0..20 {
        a.add_local_input(P1, &[7]).unwrap();
        let inputs = a.synchronize_input().unwrap();
        assert_eq!(inputs.status(0), Some(InputStatus::Confirmed));
        assert_eq!(inputs.status(1), Some(InputStatus::Disconnected));
        assert_eq!(inputs.player(1), Some(&[0][..]));
        game_a.advance(&inputs);
        a.advance_frame().unwrap();
        a.idle(0).unwrap();
    }
    assert_eq!(a.current_frame().as_i32(), 30);
    assert_eq!(a.confirmed_frame().as_i32(), 29);
}

/// Tries one frame without blocking. `input_added` carries over a frame whose local input is in
/// but whose synchronization hit the prediction threshold.
fn try_frame(
    session: &mut P2PSession,
    game: &GameStub,
    handle: PlayerHandle,
    input: u8,
    input_added: &mut bool,
) -> bool {
    if !*input_added {
        match session.add_local_input(handle, &[input]) {
            Ok(()) => *input_added = true,
            Err(NetcodeError::InputDropped | NetcodeError::PredictionThreshold) => return false,
            Err(err) => panic!("add_local_input failed: {err}"),
        }
    }
    match session.synchronize_input() {
        Ok(inputs) => {
            game.advance(&inputs);
            session.advance_frame().unwrap();
            *input_added = false;
            true
        },
        Err(NetcodeError::PredictionThreshold) => false,
        Err(err) => panic!("synchronize_input failed: {err}"),
    }
}

#[test]
fn test_peer_running_ahead_is_told_to_stall() {
    let builder = || {
        lan_builder().with_protocol_config(ProtocolConfig {
            quality_report_interval: Duration::from_millis(20),
            ..ProtocolConfig::default()
        })
    };
    let (mut a, game_a, mut b, game_b) = start_pair(builder);

    // player 1 tries three frames for every frame of player 2 and lives at the edge of the
    // prediction window
    let (mut a_added, mut b_added) = (false, false);
    while b.current_frame().as_i32() < 400 {
        for _ in 0..3 {
            let frame = a.current_frame().as_i32();
            try_frame(&mut a, &game_a, P1, input_of_a(frame), &mut a_added);
        }
        let frame = b.current_frame().as_i32();
        try_frame(&mut b, &game_b, P2, input_of_b(frame), &mut b_added);
        a.idle(0).unwrap();
        b.idle(0).unwrap();
        if game_a
            .events()
            .iter()
            .any(|event| matches!(event, Event::TimeSync { .. }))
        {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    let stalls: Vec<u32> = game_a
        .events()
        .iter()
        .filter_map(|event| match event {
            Event::TimeSync { frames_ahead } => Some(*frames_ahead),
            _ => None,
        })
        .collect();
    assert_eq!(stalls.len(), 1, "{:?}", game_a.events());
    assert!((3..=9).contains(&stalls[0]), "frames ahead {}", stalls[0]);
    assert!(!game_b
        .events()
        .iter()
        .any(|event| matches!(event, Event::TimeSync { .. })));
}

#[test]
fn test_network_stats_after_traffic() {
    let (mut a, game_a, mut b, game_b) = start_pair(lan_builder);
    run_pair(&mut a, &game_a, &mut b, &game_b, 20);

    let stats = a.network_stats(P2).unwrap();
    assert!(stats.local_frames_behind.abs() <= 8, "{stats}");
    assert!(matches!(
        a.network_stats(P1),
        Err(NetcodeError::InvalidPlayerHandle { .. })
    ));
}

#[test]
fn test_closed_session_rejects_everything() {
    let (mut a, game_a, _b, _game_b) = start_pair(lan_builder);
    a.add_local_input(P1, &[1]).unwrap();
    let inputs = a.synchronize_input().unwrap();
    game_a.advance(&inputs);
    a.advance_frame().unwrap();

    a.close().unwrap();
    assert_eq!(a.current_state(), SessionState::Closed);
    assert_eq!(game_a.freed(), game_a.saves());
    assert_eq!(a.idle(0), Err(NetcodeError::InvalidSession));
    assert_eq!(a.add_local_input(P1, &[1]), Err(NetcodeError::InvalidSession));
    assert_eq!(a.synchronize_input(), Err(NetcodeError::InvalidSession));
    assert_eq!(a.close(), Err(NetcodeError::InvalidSession));
}
