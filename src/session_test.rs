use super::*;
use crate::state::test_helpers::session_for;

// =============================================================================
// Session expiry
// =============================================================================

#[test]
fn session_without_expiry_never_expires() {
    let mut session = session_for(Uuid::new_v4(), "a@example.com");
    session.expires_at = None;
    assert!(!session.is_expired(i64::MAX));
}

#[test]
fn session_expires_at_boundary() {
    let mut session = session_for(Uuid::new_v4(), "a@example.com");
    session.expires_at = Some(1_000);
    assert!(!session.is_expired(999));
    assert!(session.is_expired(1_000));
    assert!(session.is_expired(1_001));
}

#[test]
fn session_serialize_omits_tokens() {
    let session = session_for(Uuid::nil(), "a@example.com");
    let json = serde_json::to_value(&session).unwrap();
    assert!(json.get("access_token").is_none());
    assert!(json.get("refresh_token").is_none());
    assert_eq!(json["identity"]["email"], "a@example.com");
}

// =============================================================================
// AuthError
// =============================================================================

#[test]
fn auth_error_codes() {
    let rejected = AuthError::Rejected { status: 400, message: "Invalid login credentials".into() };
    assert_eq!(rejected.error_code(), "E_AUTH_REJECTED");
    assert_eq!(rejected.to_string(), "Invalid login credentials");
    assert!(!rejected.retryable());

    assert!(AuthError::Network("timeout".into()).retryable());
    assert!(AuthError::Rejected { status: 503, message: "down".into() }.retryable());
    assert!(AuthError::Rejected { status: 429, message: "slow down".into() }.retryable());
    assert!(!AuthError::Parse("bad".into()).retryable());
}

// =============================================================================
// SessionBroadcaster
// =============================================================================

#[tokio::test]
async fn broadcaster_delivers_initial_then_events_in_order() {
    let broadcaster = SessionBroadcaster::new();
    let session = session_for(Uuid::new_v4(), "a@example.com");
    let mut rx = broadcaster.subscribe();

    broadcaster.publish(AuthChange::SignedIn, Some(session.clone()));
    broadcaster.publish(AuthChange::SignedOut, None);

    let initial = rx.recv().await.unwrap();
    assert_eq!(initial.change, AuthChange::InitialSession);
    assert!(initial.session.is_none());
    let signed_in = rx.recv().await.unwrap();
    assert_eq!(signed_in.change, AuthChange::SignedIn);
    assert_eq!(signed_in.session, Some(session));
    assert_eq!(rx.recv().await.unwrap().change, AuthChange::SignedOut);
}

#[test]
fn publish_updates_current_and_subscribe_snapshots_it() {
    let broadcaster = SessionBroadcaster::new();
    let session = session_for(Uuid::new_v4(), "a@example.com");

    broadcaster.publish(AuthChange::SignedIn, Some(session.clone()));
    assert_eq!(broadcaster.current(), Some(session.clone()));

    let mut rx = broadcaster.subscribe();
    let initial = rx.try_recv().unwrap();
    assert_eq!(initial.change, AuthChange::InitialSession);
    assert_eq!(initial.session, Some(session));
}

#[test]
fn emit_and_set_current_are_independent() {
    let broadcaster = SessionBroadcaster::new();
    let session = session_for(Uuid::new_v4(), "a@example.com");
    let mut rx = broadcaster.subscribe_quiet();

    broadcaster.set_current(Some(session.clone()));
    assert!(rx.try_recv().is_err());

    broadcaster.emit(&SessionEvent::new(AuthChange::SignedOut, None));
    assert_eq!(rx.try_recv().unwrap().change, AuthChange::SignedOut);
    assert_eq!(broadcaster.current(), Some(session));
}

#[tokio::test]
async fn broadcaster_fans_out_to_every_subscriber() {
    let broadcaster = SessionBroadcaster::new();
    let mut a = broadcaster.subscribe_quiet();
    let mut b = broadcaster.subscribe_quiet();

    broadcaster.publish(AuthChange::SignedOut, None);

    assert_eq!(a.recv().await.unwrap().change, AuthChange::SignedOut);
    assert_eq!(b.recv().await.unwrap().change, AuthChange::SignedOut);
}

#[test]
fn broadcaster_prunes_dropped_subscribers() {
    let broadcaster = SessionBroadcaster::new();
    let kept = broadcaster.subscribe();
    let dropped = broadcaster.subscribe_quiet();
    assert_eq!(broadcaster.subscriber_count(), 2);

    drop(dropped);
    broadcaster.publish(AuthChange::SignedOut, None);
    assert_eq!(broadcaster.subscriber_count(), 1);
    drop(kept);
    assert_eq!(broadcaster.subscriber_count(), 0);
}

/// Last session a subscriber has been told about.
fn last_seen(rx: &mut SessionSubscription) -> Option<Session> {
    let mut last = rx.try_recv().expect("initial event").session;
    while let Ok(event) = rx.try_recv() {
        last = event.session;
    }
    last
}

#[test]
fn concurrent_publishers_and_subscribers_converge_on_current() {
    let broadcaster = SessionBroadcaster::new();
    let sessions: Vec<Session> = (0..4)
        .map(|i| session_for(Uuid::new_v4(), &format!("user{i}@example.com")))
        .collect();

    let mut receivers = std::thread::scope(|scope| {
        for session in &sessions {
            let broadcaster = &broadcaster;
            scope.spawn(move || {
                for round in 0..500 {
                    if round % 2 == 0 {
                        broadcaster.publish(AuthChange::SignedIn, Some(session.clone()));
                    } else {
                        broadcaster.publish(AuthChange::SignedOut, None);
                    }
                }
            });
        }
        let subscriber = scope.spawn(|| {
            (0..200)
                .map(|_| {
                    std::thread::yield_now();
                    broadcaster.subscribe()
                })
                .collect::<Vec<_>>()
        });
        subscriber.join().unwrap()
    });

    let current = broadcaster.current();
    for rx in &mut receivers {
        assert_eq!(last_seen(rx), current);
    }
}

#[test]
fn sign_out_racing_a_new_subscriber_is_never_lost() {
    for _ in 0..200 {
        let broadcaster = SessionBroadcaster::new();
        broadcaster.publish(AuthChange::SignedIn, Some(session_for(Uuid::new_v4(), "a@example.com")));

        let mut rx = std::thread::scope(|scope| {
            let subscriber = scope.spawn(|| broadcaster.subscribe());
            scope.spawn(|| broadcaster.publish(AuthChange::SignedOut, None));
            subscriber.join().unwrap()
        });

        assert_eq!(last_seen(&mut rx), None);
    }
}
