use shared::{domain::MessageId, error::ErrorCode};

use super::*;

const RENTER: UserId = UserId(11);
const OWNER: UserId = UserId(12);

fn session() -> ConversationSession {
    ConversationSession::new(
        ThreadId::random(),
        RENTER,
        ReconnectPolicy::default(),
        Duration::from_secs(10),
    )
}

fn joined() -> ConversationSession {
    let mut session = session();
    assert!(session.begin_connect());
    let thread_id = session.thread_id();
    session.on_server_event(ServerEvent::History {
        thread_id,
        messages: Vec::new(),
    });
    assert_eq!(session.state(), SessionState::Joined);
    session.drain_events();
    session
}

fn payload(session: &ConversationSession, id: i64, sender: UserId, body: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        thread_id: session.thread_id(),
        sender_id: Some(sender),
        body: body.to_string(),
        read: false,
        created_at: Utc::now(),
    }
}

#[test]
fn join_moves_to_joined_and_populates_history() {
    let mut session = session();
    assert!(session.begin_connect());
    assert_eq!(session.state(), SessionState::Connecting);
    assert!(matches!(session.join_request(), ClientRequest::Join { .. }));

    let history = vec![payload(&session, 1, OWNER, "Is it available?")];
    let thread_id = session.thread_id();
    session.on_server_event(ServerEvent::History {
        thread_id,
        messages: history,
    });

    assert_eq!(session.state(), SessionState::Joined);
    assert_eq!(session.timeline().len(), 1);
    let events = session.drain_events();
    assert!(events.contains(&SessionEvent::StateChanged(SessionState::Joined)));
    assert!(events.contains(&SessionEvent::TimelineUpdated));
}

#[test]
fn optimistic_send_reconciles_on_ack_then_ignores_broadcast_copy() {
    let mut session = joined();
    let (local_id, request) = session
        .send("Bonjour", Utc::now(), Instant::now())
        .expect("send");
    match request {
        Some(ClientRequest::Send {
            sender_id, body, ..
        }) => {
            assert_eq!(sender_id, RENTER);
            assert_eq!(body, "Bonjour");
        }
        other => panic!("expected send frame, got {other:?}"),
    }
    assert_eq!(
        session.timeline().get(local_id).expect("entry").state,
        DeliveryState::Pending
    );

    let canonical = payload(&session, 77, RENTER, "Bonjour");
    session.on_server_event(ServerEvent::MessageAck(MessageAck {
        thread_id: canonical.thread_id,
        message_id: canonical.message_id,
        created_at: canonical.created_at,
        body: canonical.body.clone(),
    }));
    session.on_server_event(ServerEvent::Message { message: canonical });

    assert_eq!(session.timeline().len(), 1);
    let entry = session.timeline().get(local_id).expect("entry");
    assert_eq!(entry.state, DeliveryState::Confirmed);
    assert_eq!(entry.message_id, Some(MessageId(77)));
}

#[test]
fn broadcast_before_ack_also_reconciles() {
    let mut session = joined();
    let (local_id, _) = session
        .send("on my way", Utc::now(), Instant::now())
        .expect("send");
    let canonical = payload(&session, 3, RENTER, "on my way");
    session.on_server_event(ServerEvent::Message {
        message: canonical.clone(),
    });
    session.on_server_event(ServerEvent::MessageAck(MessageAck {
        thread_id: canonical.thread_id,
        message_id: canonical.message_id,
        created_at: canonical.created_at,
        body: canonical.body,
    }));
    assert_eq!(session.timeline().len(), 1);
    assert_eq!(
        session.timeline().get(local_id).expect("entry").message_id,
        Some(MessageId(3))
    );
}

#[test]
fn sends_while_disconnected_are_queued_until_join() {
    let mut session = session();
    let (local_id, request) = session
        .send("queued", Utc::now(), Instant::now())
        .expect("send");
    assert!(request.is_none());

    assert!(session.begin_connect());
    let thread_id = session.thread_id();
    let flushed = session.on_server_event(ServerEvent::History {
        thread_id,
        messages: Vec::new(),
    });
    assert_eq!(flushed.len(), 1);
    assert!(matches!(&flushed[0], ClientRequest::Send { body, .. } if body == "queued"));

    // A later resync must not send it again.
    let again = session.on_server_event(ServerEvent::History {
        thread_id,
        messages: Vec::new(),
    });
    assert!(again.is_empty());
    assert_eq!(
        session.timeline().get(local_id).expect("entry").state,
        DeliveryState::Pending
    );
}

#[test]
fn queued_send_matching_older_history_is_still_flushed() {
    let mut session = session();
    assert!(session.begin_connect());
    let (local_id, request) = session
        .send("ok", Utc::now(), Instant::now())
        .expect("send");
    assert!(request.is_none());

    let thread_id = session.thread_id();
    let earlier = payload(&session, 5, RENTER, "ok");
    let flushed = session.on_server_event(ServerEvent::History {
        thread_id,
        messages: vec![earlier],
    });

    assert_eq!(flushed.len(), 1);
    assert!(matches!(&flushed[0], ClientRequest::Send { body, .. } if body == "ok"));
    assert_eq!(session.timeline().len(), 2);
    let entry = session.timeline().get(local_id).expect("entry");
    assert_eq!(entry.state, DeliveryState::Pending);
    assert_eq!(entry.message_id, None);
}

#[test]
fn empty_bodies_are_rejected_locally() {
    let mut session = joined();
    assert!(matches!(
        session.send("  \n", Utc::now(), Instant::now()),
        Err(ClientError::EmptyBody)
    ));
    assert!(session.timeline().is_empty());
}

#[test]
fn connect_failures_back_off_then_suspend() {
    let mut session = session();
    let mut delays = Vec::new();
    loop {
        assert!(session.begin_connect());
        match session.on_connect_failed() {
            RetryDecision::RetryAfter(delay) => {
                assert_eq!(session.state(), SessionState::Reconnecting);
                delays.push(delay.as_secs());
            }
            RetryDecision::GiveUp => break,
            RetryDecision::Stop => panic!("unexpected stop"),
        }
    }
    assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    assert_eq!(session.state(), SessionState::Suspended);
    assert!(session
        .drain_events()
        .contains(&SessionEvent::RetriesExhausted { attempts: 6 }));

    assert!(session.retry_now());
    assert_eq!(session.state(), SessionState::Connecting);
    assert_eq!(session.attempts(), 0);
}

#[test]
fn transport_loss_while_joined_reconnects_and_keeps_timeline() {
    let mut session = joined();
    let canonical = payload(&session, 1, OWNER, "hi");
    session.on_server_event(ServerEvent::Message { message: canonical.clone() });

    assert_eq!(
        session.on_transport_lost(),
        RetryDecision::RetryAfter(Duration::ZERO)
    );
    assert_eq!(session.state(), SessionState::Reconnecting);
    assert_eq!(session.timeline().len(), 1);

    assert!(session.begin_connect());
    let thread_id = session.thread_id();
    let missed = payload(&session, 2, OWNER, "while you were away");
    session.on_server_event(ServerEvent::History {
        thread_id,
        messages: vec![canonical, missed],
    });
    assert_eq!(session.state(), SessionState::Joined);
    assert_eq!(session.timeline().len(), 2);
}

#[test]
fn pending_sends_fail_after_timeout_and_can_be_resent() {
    let mut session = joined();
    let sent_at = Instant::now();
    let (local_id, _) = session.send("ping", Utc::now(), sent_at).expect("send");

    assert!(session.expire_pending(sent_at + Duration::from_secs(5)).is_empty());
    assert_eq!(
        session.expire_pending(sent_at + Duration::from_secs(11)),
        vec![local_id]
    );
    assert!(session
        .drain_events()
        .contains(&SessionEvent::SendFailed(local_id)));

    assert!(matches!(
        session.resend(LocalId(999), Instant::now()),
        Err(ClientError::UnknownLocalMessage(_))
    ));
    let request = session.resend(local_id, Instant::now()).expect("resend");
    assert!(matches!(request, Some(ClientRequest::Send { body, .. }) if body == "ping"));
    assert!(matches!(
        session.resend(local_id, Instant::now()),
        Err(ClientError::NotFailed(_))
    ));
}

#[test]
fn resend_queued_offline_is_settled_by_the_original_copy() {
    let mut session = joined();
    let sent_at = Instant::now();
    let (local_id, _) = session.send("ping", Utc::now(), sent_at).expect("send");
    session.expire_pending(sent_at + Duration::from_secs(11));
    session.on_transport_lost();

    assert!(session.resend(local_id, Instant::now()).expect("resend").is_none());
    assert!(session.begin_connect());
    let thread_id = session.thread_id();
    let original = payload(&session, 8, RENTER, "ping");
    let flushed = session.on_server_event(ServerEvent::History {
        thread_id,
        messages: vec![original],
    });

    assert!(flushed.is_empty());
    assert_eq!(session.timeline().len(), 1);
    let entry = session.timeline().get(local_id).expect("entry");
    assert_eq!(entry.state, DeliveryState::Confirmed);
    assert_eq!(entry.message_id, Some(MessageId(8)));
}

#[test]
fn rejected_join_closes_the_session() {
    let mut session = session();
    session.begin_connect();
    session.on_server_event(ServerEvent::Error(ApiError::not_found("thread not found")));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.begin_connect());
    assert!(matches!(
        session.send("late", Utc::now(), Instant::now()),
        Err(ClientError::SessionClosed)
    ));
}

#[test]
fn send_errors_while_joined_are_surfaced_without_closing() {
    let mut session = joined();
    session.on_server_event(ServerEvent::Error(ApiError::new(
        ErrorCode::Internal,
        "database is locked",
    )));
    assert_eq!(session.state(), SessionState::Joined);
    assert!(matches!(
        session.drain_events().as_slice(),
        [SessionEvent::Error(err)] if err.code == ErrorCode::Internal
    ));
}

#[test]
fn thread_deletion_evicts_timeline_and_closes() {
    let mut session = joined();
    let canonical = payload(&session, 1, OWNER, "hi");
    session.on_server_event(ServerEvent::Message { message: canonical });
    let thread_id = session.thread_id();

    session.on_server_event(ServerEvent::ThreadDeleted { thread_id });
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.timeline().is_empty());
    assert!(session
        .drain_events()
        .contains(&SessionEvent::ThreadDeleted(thread_id)));
}

#[test]
fn events_for_other_threads_are_ignored() {
    let mut session = joined();
    let mut foreign = payload(&session, 1, OWNER, "wrong room");
    foreign.thread_id = ThreadId::random();
    session.on_server_event(ServerEvent::Message { message: foreign });
    session.on_server_event(ServerEvent::ThreadDeleted {
        thread_id: ThreadId::random(),
    });
    assert_eq!(session.state(), SessionState::Joined);
    assert!(session.timeline().is_empty());
}

#[test]
fn resync_is_only_offered_while_joined() {
    let mut session = session();
    assert!(session.resync_request().is_none());
    session.begin_connect();
    assert!(session.resync_request().is_none());
    let thread_id = session.thread_id();
    session.on_server_event(ServerEvent::History {
        thread_id,
        messages: Vec::new(),
    });
    assert!(matches!(
        session.resync_request(),
        Some(ClientRequest::Join { thread_id: raw }) if raw == thread_id.to_string()
    ));
}
