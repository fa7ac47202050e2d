use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use boardsync_core::{
    BoardEvent, Command, ConnectionId, DisconnectOutcome, DisconnectReason, EventKind, Outbound,
    PermissionSource, Permissions, SequentialAllocator, SessionError, Side,
};
use boardsync_grid::GridEngine;
use boardsync_session::{AttachRequest, LocalTransport, Replica, Session};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

const DEADLINE: Duration = Duration::from_secs(1);

struct Peer {
    id: ConnectionId,
    rx: mpsc::Receiver<Outbound>,
}

impl Peer {
    fn drain(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

fn new_session() -> Session {
    Session::new(GridEngine::boxed(), &SequentialAllocator::new())
}

async fn join(session: &Session, permissions: impl Into<PermissionSource>) -> Peer {
    join_with_queue(session, permissions, 64).await
}

async fn join_with_queue(
    session: &Session,
    permissions: impl Into<PermissionSource>,
    capacity: usize,
) -> Peer {
    let (transport, rx) = LocalTransport::channel(capacity);
    let pending = session
        .attach(AttachRequest::new(transport, permissions))
        .unwrap();
    let conn = pending.confirm(DEADLINE).await.unwrap();
    Peer {
        id: conn.id().clone(),
        rx,
    }
}

fn record(session: &Session) -> Arc<Mutex<Vec<BoardEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::PeerJoined,
        EventKind::PeerLeft,
        EventKind::BoardUpdate,
        EventKind::GameOver,
        EventKind::FirstTurn,
        EventKind::SecondTurn,
    ] {
        let sink = log.clone();
        let _ = session.on(kind, move |_, e| sink.lock().unwrap().push(e.clone()));
    }
    log
}

fn mv(square: &str) -> Command {
    Command::Move(square.into())
}

fn play(session: &Session, moves: &[&str]) {
    for square in moves {
        session.apply(&mv(square)).unwrap();
    }
}

#[tokio::test]
async fn full_control_move_broadcasts_and_notifies() {
    let session = new_session();
    let mut admin = join(&session, Permissions::full_control()).await;
    let mut watcher = join(&session, Permissions::observer()).await;
    let _ = admin.drain();
    let _ = watcher.drain();
    let events = record(&session);

    assert!(session.invoke(&admin.id, Some(json!(1)), &mv("b2")));

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            BoardEvent::BoardUpdate,
            BoardEvent::TurnChanged { side: Side::Second }
        ]
    );
    assert_eq!(
        admin.drain(),
        vec![Outbound::CallResult {
            request_id: Some(json!(1)),
            accepted: true
        }]
    );
    assert_eq!(
        watcher.drain(),
        vec![Outbound::MethodCall { command: mv("b2") }]
    );
}

#[tokio::test]
async fn observer_move_is_refused_silently() {
    let session = new_session();
    let mut observer = join(&session, Permissions::observer()).await;
    let mut other = join(&session, Permissions::full_control()).await;
    let _ = observer.drain();
    let _ = other.drain();
    let events = record(&session);
    let before = session.snapshot();

    assert!(!session.invoke(&observer.id, None, &mv("a1")));

    assert_eq!(session.snapshot(), before);
    assert!(events.lock().unwrap().is_empty());
    assert!(other.drain().is_empty());
    assert_eq!(
        observer.drain(),
        vec![Outbound::CallResult {
            request_id: None,
            accepted: false
        }]
    );
}

#[tokio::test]
async fn player_cannot_move_out_of_turn() {
    let session = new_session();
    let first = join(&session, Permissions::first_player()).await;
    let second = join(&session, Permissions::second_player()).await;

    assert!(!session.invoke(&second.id, None, &mv("a1")));
    assert!(session.invoke(&first.id, None, &mv("a1")));
    let after_first = session.snapshot();
    assert!(!session.invoke(&first.id, None, &mv("a2")));
    assert_eq!(session.snapshot(), after_first);

    let err = session.try_invoke(&first.id, None, &mv("a2")).unwrap_err();
    assert_eq!(err.error_kind(), "invocation_denied");
}

#[tokio::test]
async fn players_cannot_use_admin_operations() {
    let session = new_session();
    let first = join(&session, Permissions::first_player()).await;
    assert!(session.invoke(&first.id, None, &mv("a1")));
    assert!(!session.invoke(&first.id, None, &Command::Undo));
    assert!(!session.invoke(&first.id, None, &Command::Reset));
}

#[tokio::test]
async fn allow_list_bypasses_role_gate() {
    let session = new_session();
    let moderator = join(
        &session,
        Permissions::observer().with_operation(boardsync_core::Operation::Move),
    )
    .await;
    assert!(session.invoke(&moderator.id, None, &mv("a1")));
    assert!(session.invoke(&moderator.id, None, &mv("a2")));
}

#[tokio::test]
async fn engine_rejection_is_reported_and_not_broadcast() {
    let session = new_session();
    let admin = join(&session, Permissions::full_control()).await;
    let mut watcher = join(&session, Permissions::observer()).await;
    assert!(session.invoke(&admin.id, None, &mv("a1")));
    let _ = watcher.drain();
    let events = record(&session);

    let err = session.try_invoke(&admin.id, None, &mv("a1")).unwrap_err();
    assert!(matches!(err, SessionError::OperationFailed { .. }));
    assert!(err.is_rejection());
    assert!(watcher.drain().is_empty());
    assert!(events.lock().unwrap().is_empty());

    assert!(session.invoke(&admin.id, None, &mv("a2")));
}

#[tokio::test]
async fn not_allowed_connection_is_rejected_before_exposure() {
    let session = new_session();
    let (transport, mut rx) = LocalTransport::channel(8);
    let err = session
        .attach(AttachRequest::new(transport, Permissions::not_allowed()))
        .unwrap_err();
    assert!(matches!(err, SessionError::ConnectionRejected(_)));
    assert_eq!(session.connection_count(), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn handshake_carries_snapshot_and_session_id() {
    let session = new_session();
    session.apply(&mv("c3")).unwrap();
    let (transport, mut rx) = LocalTransport::channel(8);
    let pending = session
        .attach(
            AttachRequest::new(transport, Permissions::observer())
                .handshake_data(json!({"hello": true})),
        )
        .unwrap();
    let _ = pending.confirm(DEADLINE).await.unwrap();

    match rx.try_recv().unwrap() {
        Outbound::Handshake {
            session_id,
            snapshot,
            data,
        } => {
            assert_eq!(&session_id, session.id());
            assert_eq!(snapshot, session.snapshot());
            assert_eq!(data, Some(json!({"hello": true})));
        }
        other => panic!("expected handshake, got {other:?}"),
    }
}

#[tokio::test]
async fn second_attach_announces_to_first_only() {
    let session = new_session();
    let mut first = join(&session, Permissions::first_player()).await;
    let seen_by_first = match first.drain().pop() {
        Some(Outbound::Handshake { snapshot, .. }) => snapshot,
        other => panic!("expected handshake, got {other:?}"),
    };
    let events = record(&session);

    let mut second = join(&session, Permissions::second_player()).await;

    assert_eq!(session.snapshot(), seen_by_first);
    assert_eq!(
        first.drain(),
        vec![Outbound::PeerJoined {
            connection_id: second.id.clone()
        }]
    );
    let to_second = second.drain();
    assert_eq!(to_second.len(), 1);
    assert!(matches!(to_second[0], Outbound::Handshake { .. }));
    assert_eq!(
        *events.lock().unwrap(),
        vec![BoardEvent::PeerJoined {
            connection_id: second.id.clone()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn peer_joined_waits_for_handshake_ack() {
    let session = new_session();
    let mut first = join(&session, Permissions::observer()).await;
    let _ = first.drain();

    let (transport, _rx) = LocalTransport::manual_ack(8);
    let pending = session
        .attach(AttachRequest::new(transport.clone(), Permissions::observer()))
        .unwrap();
    assert_eq!(session.connection_count(), 2);
    assert!(first.drain().is_empty());

    let confirm = tokio::spawn(pending.confirm(DEADLINE));
    tokio::task::yield_now().await;
    assert_eq!(transport.acknowledge(), 1);
    let conn = confirm.await.unwrap().unwrap();

    assert_eq!(
        first.drain(),
        vec![Outbound::PeerJoined {
            connection_id: conn.id().clone()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_handshake_times_out_but_stays_registered() {
    let session = new_session();
    let (transport, _rx) = LocalTransport::manual_ack(8);
    let pending = session
        .attach(AttachRequest::new(transport, Permissions::observer()))
        .unwrap();
    let id = pending.connection().id().clone();

    let err = pending.confirm(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, SessionError::HandshakeTimeout(_)));
    assert!(session.connection(&id).is_some());
    assert_eq!(session.evict(&id), DisconnectOutcome::DeliberateDisconnect);
}

#[tokio::test]
async fn deliberate_disconnect_removes_transient_retains() {
    let session = new_session();
    let leaving = join(&session, Permissions::observer()).await;
    let flaky = join(&session, Permissions::first_player()).await;
    let events = record(&session);

    assert_eq!(
        session.disconnect(&leaving.id, DisconnectReason::ClientClose),
        DisconnectOutcome::DeliberateDisconnect
    );
    assert!(session.connection(&leaving.id).is_none());
    assert_eq!(
        *events.lock().unwrap(),
        vec![BoardEvent::PeerLeft {
            connection_id: leaving.id.clone(),
            reason: DisconnectReason::ClientClose
        }]
    );

    assert_eq!(
        session.disconnect(&flaky.id, DisconnectReason::TransportClose),
        DisconnectOutcome::TransportLost
    );
    assert!(session.connection(&flaky.id).is_some());
    assert_eq!(events.lock().unwrap().len(), 1);

    assert_eq!(
        session.disconnect(&leaving.id, DisconnectReason::ClientClose),
        DisconnectOutcome::Unknown
    );
}

#[tokio::test]
async fn retained_connection_can_resync_and_keep_playing() {
    let session = new_session();
    let mut player = join(&session, Permissions::first_player()).await;
    let _ = player.drain();
    session.apply(&mv("b2")).unwrap();

    assert_eq!(
        session.disconnect(&player.id, DisconnectReason::PingTimeout),
        DisconnectOutcome::TransportLost
    );
    let snapshot = session.resync(&player.id, Some(json!("r1"))).unwrap();
    assert_eq!(snapshot, session.snapshot());
    let frames = player.drain();
    assert_eq!(
        frames.last(),
        Some(&Outbound::ResyncResult {
            request_id: Some(json!("r1")),
            snapshot,
        })
    );
}

#[tokio::test]
async fn lagging_peer_is_dropped_instead_of_missing_broadcasts() {
    let session = new_session();
    // Room for the handshake and one more frame.
    let mut slow = join_with_queue(&session, Permissions::second_player(), 2).await;
    let mut mover = join(&session, Permissions::first_player()).await;
    let _ = mover.drain();
    let events = record(&session);

    // peer_joined filled the slow queue; this broadcast cannot fit.
    assert!(session.invoke(&mover.id, Some(json!(1)), &mv("a1")));

    assert!(session.connection(&slow.id).is_none());
    assert_eq!(session.connection_count(), 1);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            BoardEvent::BoardUpdate,
            BoardEvent::TurnChanged { side: Side::Second },
            BoardEvent::PeerLeft {
                connection_id: slow.id.clone(),
                reason: DisconnectReason::QueueOverflow,
            },
        ]
    );

    let kinds: Vec<_> = slow.drain().iter().map(Outbound::kind).collect();
    assert_eq!(kinds, vec!["handshake", "peer_joined"]);
    assert_eq!(slow.rx.try_recv(), Err(TryRecvError::Disconnected));
    assert!(matches!(
        session.try_invoke(&slow.id, None, &mv("b1")),
        Err(SessionError::UnknownConnection(_))
    ));

    // The mover still got its reply.
    assert_eq!(
        mover.drain(),
        vec![Outbound::CallResult {
            request_id: Some(json!(1)),
            accepted: true,
        }]
    );
}

#[tokio::test]
async fn caller_with_full_queue_is_hung_up_rather_than_left_waiting() {
    let session = new_session();
    let mut caller = join_with_queue(&session, Permissions::full_control(), 1).await;

    // The handshake still occupies the only slot.
    assert!(session.invoke(&caller.id, Some(json!(9)), &mv("b2")));

    assert!(session.connection(&caller.id).is_none());
    let kinds: Vec<_> = caller.drain().iter().map(Outbound::kind).collect();
    assert_eq!(kinds, vec!["handshake"]);
    assert_eq!(caller.rx.try_recv(), Err(TryRecvError::Disconnected));
}

#[tokio::test]
async fn resync_never_mutates_or_notifies() {
    let session = new_session();
    let peer = join(&session, Permissions::observer()).await;
    let mut other = join(&session, Permissions::observer()).await;
    session.apply(&mv("a1")).unwrap();
    let _ = other.drain();
    let events = record(&session);

    for _ in 0..3 {
        assert_eq!(session.resync(&peer.id, None).unwrap(), session.snapshot());
    }
    assert!(events.lock().unwrap().is_empty());
    assert!(other.drain().is_empty());
}

#[tokio::test]
async fn unknown_connection_is_reported() {
    let session = new_session();
    let stranger = ConnectionId::new();
    assert!(matches!(
        session.try_invoke(&stranger, None, &mv("a1")),
        Err(SessionError::UnknownConnection(_))
    ));
    assert!(session.resync(&stranger, None).is_err());
}

#[tokio::test]
async fn local_apply_reaches_every_connection() {
    let session = new_session();
    let mut a = join(&session, Permissions::observer()).await;
    let mut b = join(&session, Permissions::observer()).await;
    let _ = a.drain();
    let _ = b.drain();

    session.apply(&Command::Reset).unwrap();
    assert_eq!(a.drain(), vec![Outbound::MethodCall { command: Command::Reset }]);
    assert_eq!(b.drain(), vec![Outbound::MethodCall { command: Command::Reset }]);
}

#[tokio::test]
async fn one_board_update_per_changing_commit() {
    let session = new_session();
    let admin = join(&session, Permissions::full_control()).await;
    let updates = Arc::new(Mutex::new(0));
    let counter = updates.clone();
    let _ = session.on(EventKind::BoardUpdate, move |_, _| *counter.lock().unwrap() += 1);

    assert!(session.invoke(&admin.id, None, &mv("a1")));
    assert!(!session.invoke(&admin.id, None, &mv("a1")));
    assert!(session.invoke(&admin.id, None, &Command::Undo));
    // Already at the initial position: accepted, but nothing changed.
    assert!(session.invoke(&admin.id, None, &Command::Reset));

    assert_eq!(*updates.lock().unwrap(), 2);
}

#[tokio::test]
async fn game_over_repeats_while_terminal() {
    let session = new_session();
    let admin = join(&session, Permissions::full_control()).await;
    for square in ["a1", "a2", "b1", "b2"] {
        assert!(session.invoke(&admin.id, None, &mv(square)));
    }
    let events = record(&session);

    assert!(session.invoke(&admin.id, None, &mv("c1")));
    assert!(session.is_game_over());
    // Editing a finished board keeps it finished and announces no mover.
    let headers = [("site".to_owned(), "club".to_owned())].into_iter().collect();
    assert!(session.invoke(&admin.id, None, &Command::SetHeaders(headers)));
    assert!(session.is_game_over());
    assert!(session.invoke(&admin.id, None, &Command::Remove("a2".into())));

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            BoardEvent::BoardUpdate,
            BoardEvent::GameOver,
            BoardEvent::BoardUpdate,
            BoardEvent::GameOver,
            BoardEvent::BoardUpdate,
            BoardEvent::GameOver,
        ]
    );
}

#[tokio::test]
async fn reset_after_game_over_announces_only_a_new_mover() {
    let session = new_session();
    // Last announced mover before the winning move is First.
    play(&session, &["a1", "a2", "b1", "b2", "c1"]);
    assert!(session.is_game_over());
    let events = record(&session);

    session.apply(&Command::Reset).unwrap();
    assert_eq!(session.turn(), Side::First);
    assert_eq!(*events.lock().unwrap(), vec![BoardEvent::BoardUpdate]);

    session.apply(&mv("a1")).unwrap();
    assert_eq!(
        events.lock().unwrap()[1..],
        [
            BoardEvent::BoardUpdate,
            BoardEvent::TurnChanged { side: Side::Second }
        ]
    );
}

#[tokio::test]
async fn off_stops_delivery() {
    let session = new_session();
    let count = Arc::new(Mutex::new(0));
    let counter = count.clone();
    let id = session.on(EventKind::BoardUpdate, move |_, _| *counter.lock().unwrap() += 1);

    session.apply(&mv("a1")).unwrap();
    assert!(session.off(EventKind::BoardUpdate, id));
    session.apply(&mv("a2")).unwrap();
    assert!(!session.off(EventKind::BoardUpdate, id));

    assert_eq!(*count.lock().unwrap(), 1);
}

#[tokio::test]
async fn handlers_see_committed_state() {
    let session = new_session();
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let _ = session.on(EventKind::SecondTurn, move |view, _| {
        *sink.lock().unwrap() = Some(view.clone());
    });
    session.apply(&mv("b2")).unwrap();

    let view = seen.lock().unwrap().clone().unwrap();
    assert_eq!(view.snapshot, session.snapshot());
    assert_eq!(view.turn, Side::Second);
    assert_eq!(&view.session_id, session.id());
}

#[tokio::test]
async fn resolver_is_consulted_on_every_check() {
    let session = new_session();
    let promoted = Arc::new(AtomicBool::new(false));
    let flag = promoted.clone();
    let source = PermissionSource::resolver(move |_| {
        if flag.load(Ordering::SeqCst) {
            Permissions::full_control()
        } else {
            Permissions::observer()
        }
    });
    let peer = join(&session, source).await;

    assert!(!session.invoke(&peer.id, None, &mv("a1")));
    promoted.store(true, Ordering::SeqCst);
    assert!(session.invoke(&peer.id, None, &mv("a1")));
}

#[tokio::test]
async fn resolver_sees_connect_metadata() {
    let session = new_session();
    let (transport, _rx) = LocalTransport::channel(8);
    let source = PermissionSource::resolver(|ctx| {
        let role = ctx
            .metadata
            .as_ref()
            .and_then(|m| m.get("role"))
            .and_then(|r| r.as_str());
        role.and_then(Permissions::preset)
            .unwrap_or_else(Permissions::not_allowed)
    });
    let pending = session
        .attach(
            AttachRequest::new(transport, source.clone())
                .metadata(json!({"role": "first"})),
        )
        .unwrap();
    let conn = pending.confirm(DEADLINE).await.unwrap();
    assert!(conn.permissions().can_act_as_first);

    let (transport, _rx) = LocalTransport::channel(8);
    assert!(session
        .attach(AttachRequest::new(transport, source))
        .is_err());
}

#[test]
fn sessions_take_ids_from_the_allocator() {
    let ids = SequentialAllocator::new();
    let a = Session::new(GridEngine::boxed(), &ids);
    let b = Session::new(GridEngine::boxed(), &ids);
    assert_eq!(a.id().as_str(), "board_0");
    assert_eq!(b.id().as_str(), "board_1");
}

/// Every peer rebuilds the canonical board from its handshake, the
/// broadcast stream, and its own accepted calls.
#[tokio::test]
async fn replicas_track_the_canonical_snapshot() {
    let session = new_session();
    let mut peers = Vec::new();
    for perms in [
        Permissions::first_player(),
        Permissions::second_player(),
        Permissions::full_control(),
        Permissions::observer(),
    ] {
        let peer = join(&session, perms).await;
        peers.push((peer, Replica::new(GridEngine::boxed())));
    }

    let script: Vec<(usize, Command)> = vec![
        (0, mv("a1")),
        (0, mv("a2")),
        (1, mv("b2")),
        (3, mv("c3")),
        (2, Command::Undo),
        (1, mv("c3")),
        (2, Command::Remove("a1".into())),
        (0, mv("a1")),
        (2, Command::LoadHistory("b2 a1 c3".into())),
        (1, mv("b1")),
        (2, Command::Reset),
    ];

    sync_all(&mut peers, &[]);
    for (who, command) in script {
        let id = peers[who].0.id.clone();
        let _ = session.invoke(&id, None, &command);
        sync_all(&mut peers, &[(who, command)]);
        for (_, replica) in &peers {
            assert_eq!(replica.snapshot(), session.snapshot());
        }
    }
}

fn sync_all(peers: &mut [(Peer, Replica)], issued: &[(usize, Command)]) {
    for (index, (peer, replica)) in peers.iter_mut().enumerate() {
        for frame in peer.drain() {
            match &frame {
                Outbound::CallResult { accepted: true, .. } => {
                    let (_, command) = issued
                        .iter()
                        .find(|(who, _)| *who == index)
                        .unwrap();
                    replica.apply_own(command).unwrap();
                }
                _ => replica.handle(&frame).unwrap(),
            }
        }
    }
}
