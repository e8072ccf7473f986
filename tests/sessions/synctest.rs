//! SyncTest session integration tests.

use crate::common::stubs::{baseline, GameStub};
use rollback_netcode::{
    start_synctest, Frame, NetcodeError, PlayerHandle, Session, SessionBuilder, SyncTestSession,
};

fn inputs_for(frame: i32) -> Vec<Vec<u8>> {
    vec![vec![(frame % 7) as u8], vec![(frame % 4) as u8 + 20]]
}

fn run_frame(session: &mut SyncTestSession, game: &GameStub, frame: i32) -> Result<(), NetcodeError> {
    for (player, input) in inputs_for(frame).iter().enumerate() {
        session.add_local_input(PlayerHandle::new(player), input)?;
    }
    let inputs = session.synchronize_input()?;
    game.advance(&inputs);
    session.advance_frame()
}

#[test]
fn test_deterministic_game_survives_every_check() {
    let game = GameStub::new();
    let mut session = start_synctest(game.clone(), "synctest", 2, 1, 4).unwrap();
    assert_eq!(session.check_distance(), 4);

    for frame in 0..60 {
        run_frame(&mut session, &game, frame).unwrap();
    }

    assert_eq!(session.current_frame(), Frame::new(60));
    assert_eq!(session.last_verified_frame(), Frame::new(60));
    assert_eq!(game.loads(), 15);
    assert_eq!(game.replayed(), 60);
    assert_eq!(game.state(), baseline(60, inputs_for));
    assert!(game.logs().is_empty());
}

#[test]
fn test_every_check_distance_replays_all_frames() {
    for check_distance in 1..8 {
        let game = GameStub::new();
        let mut session = SessionBuilder::new(2, 1)
            .with_check_distance(check_distance)
            .start_synctest_session(game.clone())
            .unwrap();
        for frame in 0..420 {
            run_frame(&mut session, &game, frame).unwrap();
        }
        // 420 is a multiple of every distance in 1..8
        assert_eq!(game.replayed(), 420, "check distance {check_distance}");
        assert_eq!(game.state(), baseline(420, inputs_for));
    }
}

#[test]
fn test_check_distance_must_fit_the_state_ring() {
    for check_distance in [0, 8, 9] {
        let result = SessionBuilder::new(2, 1)
            .with_check_distance(check_distance)
            .start_synctest_session(GameStub::new());
        assert!(
            matches!(result, Err(NetcodeError::InvalidRequest { .. })),
            "check distance {check_distance}"
        );
    }
}

#[test]
fn test_non_deterministic_game_is_reported_with_both_states() {
    let game = GameStub::leaky();
    let mut session = start_synctest(game.clone(), "synctest", 2, 1, 2).unwrap();

    run_frame(&mut session, &game, 0).unwrap();
    let err = run_frame(&mut session, &game, 1).unwrap_err();
    let NetcodeError::MismatchedChecksum {
        frame,
        original,
        replayed,
    } = err
    else {
        panic!("expected a checksum mismatch, got {err}");
    };
    assert_eq!(frame, Frame::new(1));
    assert_ne!(original, replayed);
    assert_eq!(
        game.logs(),
        vec![
            "synclogs/state-1-original.log".to_owned(),
            "synclogs/state-1-replay.log".to_owned(),
        ]
    );
}

#[test]
fn test_input_delay_shifts_every_player() {
    let game = GameStub::new();
    let mut session = SessionBuilder::new(2, 1)
        .with_input_delay(3)
        .unwrap()
        .with_check_distance(2)
        .start_synctest_session(game.clone())
        .unwrap();
    for frame in 0..20 {
        run_frame(&mut session, &game, frame).unwrap();
    }
    let expected = baseline(20, |frame| {
        if frame < 3 {
            vec![vec![0], vec![0]]
        } else {
            inputs_for(frame - 3)
        }
    });
    assert_eq!(game.state(), expected);
}

#[test]
fn test_close_hands_back_every_state() {
    let game = GameStub::new();
    let mut session = start_synctest(game.clone(), "synctest", 2, 1, 3).unwrap();
    for frame in 0..10 {
        run_frame(&mut session, &game, frame).unwrap();
    }
    session.close().unwrap();
    assert!(game.saves() > 0);
    assert_eq!(game.freed(), game.saves());
    assert_eq!(
        run_frame(&mut session, &game, 10),
        Err(NetcodeError::InvalidSession)
    );
}
