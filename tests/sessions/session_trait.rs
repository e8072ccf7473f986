//! Behavior every session type shares through `dyn Session`.

use crate::common::stubs::{baseline, GameStub};
use crate::common::{synchronize_sessions, test_addr};
use rollback_netcode::{
    LoopbackNetwork, NetcodeError, Player, PlayerHandle, Session, SessionBuilder, SessionState,
};

/// One frame for a host whose players are all local.
fn run_local_frame(
    session: &mut dyn Session,
    game: &GameStub,
    frame: i32,
) -> Result<(), NetcodeError> {
    session.idle(0)?;
    session.add_local_input(PlayerHandle::new(0), &[frame as u8])?;
    session.add_local_input(PlayerHandle::new(1), &[frame as u8 ^ 0xff])?;
    let inputs = session.synchronize_input()?;
    game.advance(&inputs);
    session.advance_frame()
}

fn expected(frames: i32) -> crate::common::stubs::StateStub {
    baseline(frames, |frame| vec![vec![frame as u8], vec![frame as u8 ^ 0xff]])
}

/// A local-only P2P session and a sync test, both with two players.
fn local_sessions() -> Vec<(Box<dyn Session>, GameStub)> {
    let network = LoopbackNetwork::new();
    let p2p_game = GameStub::new();
    let mut p2p = SessionBuilder::new(2, 1)
        .start_p2p_session(p2p_game.clone(), network.socket(test_addr(1)))
        .unwrap();
    p2p.add_player(Player::local(1)).unwrap();
    p2p.add_player(Player::local(2)).unwrap();

    let synctest_game = GameStub::new();
    let synctest = SessionBuilder::new(2, 1)
        .with_check_distance(3)
        .start_synctest_session(synctest_game.clone())
        .unwrap();

    vec![
        (Box::new(p2p) as Box<dyn Session>, p2p_game),
        (Box::new(synctest), synctest_game),
    ]
}

#[test]
fn test_same_frame_loop_drives_every_local_session() {
    for (mut session, game) in local_sessions() {
        for frame in 0..30 {
            run_local_frame(session.as_mut(), &game, frame).unwrap();
        }
        assert_eq!(session.current_state(), SessionState::Running);
        assert_eq!(session.current_frame().as_i32(), 30);
        assert_eq!(game.state(), expected(30));
    }
}

#[test]
fn test_advance_frame_needs_synchronized_inputs() {
    for (mut session, _game) in local_sessions() {
        session.idle(0).unwrap();
        session.add_local_input(PlayerHandle::new(0), &[1]).unwrap();
        session.add_local_input(PlayerHandle::new(1), &[2]).unwrap();
        assert!(matches!(
            session.advance_frame(),
            Err(NetcodeError::InvalidRequest { .. })
        ));
    }
}

#[test]
fn test_wrong_input_size_is_rejected() {
    for (mut session, _game) in local_sessions() {
        session.idle(0).unwrap();
        assert!(matches!(
            session.add_local_input(PlayerHandle::new(0), &[1, 2]),
            Err(NetcodeError::InvalidRequest { .. })
        ));
        assert_eq!(
            session.add_local_input(PlayerHandle::new(5), &[1]),
            Err(NetcodeError::InvalidPlayerHandle {
                handle: PlayerHandle::new(5)
            })
        );
    }
}

#[test]
fn test_closed_sessions_only_answer_invalid_session() {
    let network = LoopbackNetwork::new();
    let mut host = SessionBuilder::new(1, 1)
        .start_p2p_session(GameStub::new(), network.socket(test_addr(1)))
        .unwrap();
    host.add_player(Player::local(1)).unwrap();
    host.add_player(Player::spectator(test_addr(9))).unwrap();
    let mut spectator = SessionBuilder::new(1, 1)
        .start_spectator_session(test_addr(1), GameStub::new(), network.socket(test_addr(9)))
        .unwrap();
    synchronize_sessions(&mut [&mut host, &mut spectator]).unwrap();

    let mut sessions: Vec<Box<dyn Session>> = local_sessions()
        .into_iter()
        .map(|(session, _game)| session)
        .collect();
    sessions.push(Box::new(host));
    sessions.push(Box::new(spectator));

    for session in &mut sessions {
        session.close().unwrap();
        assert_eq!(session.current_state(), SessionState::Closed);
        assert_eq!(session.close(), Err(NetcodeError::InvalidSession));
        assert_eq!(session.idle(0), Err(NetcodeError::InvalidSession));
        assert_eq!(
            session.add_player(Player::local(1)),
            Err(NetcodeError::InvalidSession)
        );
        assert_eq!(
            session.set_frame_delay(PlayerHandle::new(0), 1),
            Err(NetcodeError::InvalidSession)
        );
        assert_eq!(
            session.disconnect_player(PlayerHandle::new(0)),
            Err(NetcodeError::InvalidSession)
        );
        assert_eq!(
            session.network_stats(PlayerHandle::new(0)),
            Err(NetcodeError::InvalidSession)
        );
        assert_eq!(
            session.set_disconnect_timeout(100),
            Err(NetcodeError::InvalidSession)
        );
        assert_eq!(
            session.synchronize_input().map(|_| ()),
            Err(NetcodeError::InvalidSession)
        );
        assert_eq!(session.advance_frame(), Err(NetcodeError::InvalidSession));
    }
}

#[test]
fn test_network_operations_on_sync_test_are_unsupported() {
    let mut session = SessionBuilder::new(2, 1)
        .start_synctest_session(GameStub::new())
        .unwrap();
    assert_eq!(
        session.disconnect_player(PlayerHandle::new(0)),
        Err(NetcodeError::Unsupported)
    );
    assert_eq!(
        session.set_frame_delay(PlayerHandle::new(0), 2),
        Err(NetcodeError::Unsupported)
    );
    assert_eq!(
        session.network_stats(PlayerHandle::new(0)),
        Err(NetcodeError::Unsupported)
    );
    assert_eq!(
        session.set_disconnect_notify_start(10),
        Err(NetcodeError::Unsupported)
    );
}
