//! End-to-end messaging between simulated devices.
//!
//! Every test runs whole messengers against one shared `SimDirectory`, so
//! the session handshake, relay bookkeeping and inbox all take part.

use std::time::Duration;

use pinpoint_client::{MessengerError, MessengerEvent};
use pinpoint_core::{Environment, MessagePayload, SessionError};
use pinpoint_harness::{Request, SimWorld};
use pinpoint_proto::{ErrorKind, PeerAddress, RemoteError};

fn address(name: &str) -> PeerAddress {
    PeerAddress::new(name, 1)
}

#[tokio::test]
async fn location_round_trip_between_two_devices() {
    let world = SimWorld::new(1);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    let sent = world.location(52.52, 13.405).expect("valid location");
    alice.send_location(&address("bob"), &sent).await.expect("send");

    let report = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(report.fetched, 1);
    assert_eq!(report.stored, 1);
    assert_eq!(report.deleted, 1);
    assert!(report.maintenance_error.is_none());

    let stored = bob.message(&address("alice")).expect("inbox read").expect("message stored");
    assert_eq!(stored.location(), Some(&sent));
    assert!(world.directory.pending_messages(&address("bob")).is_empty());

    // Both directions are set up by the one message.
    assert!(alice.store().has_session(&address("bob")).expect("store read"));
    assert!(bob.store().has_session(&address("alice")).expect("store read"));
}

#[tokio::test]
async fn reply_completes_the_handshake() {
    let world = SimWorld::new(2);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    alice.send_location(&address("bob"), &world.location(1.0, 1.0).expect("location")).await.expect("send");
    bob.receive_and_reconcile().await.expect("bob receive");

    // Bob answers on the session Alice's prekey message created.
    bob.send_location(&address("alice"), &world.location(2.0, 2.0).expect("location")).await.expect("reply");
    assert_eq!(world.directory.request_count(Request::FetchPreKeyBundle), 1);

    let report = alice.receive_and_reconcile().await.expect("alice receive");
    assert_eq!(report.stored, 1);
    let reply = alice.message(&address("bob")).expect("inbox read").expect("reply stored");
    assert_eq!(reply.location().map(|l| l.latitude), Some(2.0));

    // Alice has heard back, so further messages go out without a handshake
    // and Bob still decrypts them.
    alice.send_location(&address("bob"), &world.location(3.0, 3.0).expect("location")).await.expect("send");
    bob.receive_and_reconcile().await.expect("bob receive");
    let latest = bob.message(&address("alice")).expect("inbox read").expect("stored");
    assert_eq!(latest.location().map(|l| l.latitude), Some(3.0));
}

#[tokio::test]
async fn only_the_latest_message_per_sender_is_kept() {
    let world = SimWorld::new(3);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    for step in 0..3 {
        world.env.advance(Duration::from_secs(30));
        let location = world.location(10.0 + f64::from(step), 20.0).expect("location");
        alice.send_location(&address("bob"), &location).await.expect("send");
    }

    let report = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(report.stored, 3);

    let summary = bob.summaries().expect("summaries");
    assert_eq!(summary.entries.len(), 1);
    let latest = bob.message(&address("alice")).expect("inbox read").expect("stored");
    assert_eq!(latest.location().map(|l| l.latitude), Some(12.0));
}

#[tokio::test]
async fn lost_first_message_still_reaches_the_peer() {
    let world = SimWorld::new(4);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    alice.send_location(&address("bob"), &world.location(1.0, 1.0).expect("location")).await.expect("send");
    let first = world.directory.pending_messages(&address("bob"));
    assert!(world.directory.drop_message(first[0].id));

    alice.send_location(&address("bob"), &world.location(5.0, 5.0).expect("location")).await.expect("send");
    let report = bob.receive_and_reconcile().await.expect("receive");

    assert_eq!(report.stored, 1);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn corrupt_message_becomes_an_error_marker_and_is_deleted() {
    let world = SimWorld::new(5);
    let bob = world.device("bob", 1).await.expect("bob device");
    let mallory = address("mallory");

    let id = world.directory.inject_message(&address("bob"), &mallory, 7, vec![0xff, 0x00, 0x13]);
    let report = bob.receive_and_reconcile().await.expect("receive");

    assert_eq!(report.failed, 1);
    assert_eq!(report.deleted, 1);
    let stored = bob.message(&mallory).expect("inbox read").expect("marker stored");
    assert_eq!(stored.id, id);
    assert_eq!(stored.payload, MessagePayload::Error(ErrorKind::Format));

    let summary = bob.summaries().expect("summaries");
    assert!(summary.entries[0].is_error);
}

#[tokio::test]
async fn corrupt_inbox_entry_fails_the_summary_once() {
    let world = SimWorld::new(14);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    alice.send_location(&address("bob"), &world.location(1.0, 1.0).expect("location")).await.expect("send");
    bob.receive_and_reconcile().await.expect("receive");
    bob.store().backend().insert_raw("bob.1/msg:carol.1", vec![0xff]);

    let error = bob.summaries().expect_err("corrupt entry");
    assert_eq!(error.kind(), ErrorKind::Format);
    assert!(bob.message(&address("carol")).expect("inbox read").is_none());

    let summary = bob.summaries().expect("summaries");
    assert_eq!(summary.entries.len(), 1);
    assert_eq!(summary.entries[0].sender, address("alice"));
}

#[tokio::test]
async fn send_to_unknown_recipient_fails_without_side_effects() {
    let world = SimWorld::new(6);
    let alice = world.device("alice", 1).await.expect("alice device");
    world.device("carol", 1).await.expect("carol device");

    let location = world.location(0.0, 0.0).expect("location");
    let unknown = alice.send_location(&address("nobody"), &location).await.expect_err("unknown user");
    assert_eq!(unknown.kind(), ErrorKind::RecipientNotFound);

    let no_device = alice.send_location(&PeerAddress::new("carol", 2), &location).await.expect_err("no device");
    assert_eq!(no_device.kind(), ErrorKind::RecipientHasNoDevice);

    assert!(!alice.store().has_session(&address("nobody")).expect("store read"));
}

#[tokio::test]
async fn invalid_location_is_rejected_before_any_request() {
    let world = SimWorld::new(7);
    let alice = world.device("alice", 1).await.expect("alice device");
    world.device("bob", 1).await.expect("bob device");

    let mut location = world.location(0.0, 0.0).expect("location");
    location.latitude = 91.0;
    let error = alice.send_location(&address("bob"), &location).await.expect_err("invalid");

    assert!(matches!(error, MessengerError::InvalidLocation(_)));
    assert_eq!(world.directory.request_count(Request::FetchPreKeyBundle), 0);
    assert_eq!(world.directory.request_count(Request::SendMessage), 0);
}

#[tokio::test]
async fn send_without_device_fails() {
    let world = SimWorld::new(8);
    let alice = world.messenger("alice", 1);
    world.device("bob", 1).await.expect("bob device");

    let error = alice
        .send_location(&address("bob"), &world.location(0.0, 0.0).expect("location"))
        .await
        .expect_err("no device");
    assert_eq!(error.kind(), ErrorKind::NoLocalDevice);
}

#[tokio::test]
async fn reinstalled_recipient_requires_consent_before_sending() {
    let world = SimWorld::new(9);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");
    let mut events = alice.subscribe();

    alice.send_location(&address("bob"), &world.location(1.0, 1.0).expect("location")).await.expect("send");
    bob.receive_and_reconcile().await.expect("receive");

    // Bob reinstalls: new identity and registration under the same address.
    bob.delete_device().await.expect("delete");
    let new_identity = bob.create_device().await.expect("recreate");

    let location = world.location(2.0, 2.0).expect("location");
    let error = alice.send_location(&address("bob"), &location).await.expect_err("gated");
    assert_eq!(error.kind(), ErrorKind::AlteredIdentity);
    assert!(matches!(error, MessengerError::Session(SessionError::AlteredIdentity { .. })));
    assert_eq!(alice.pending_identity(&address("bob")).expect("store read"), Some(new_identity));
    assert!(world.directory.pending_messages(&address("bob")).is_empty());

    let event = events.try_recv().expect("identity event");
    assert_eq!(event, MessengerEvent::IdentityChanged {
        peer: address("bob"),
        fingerprint: new_identity.fingerprint(),
    });

    assert!(alice.accept_new_identity(&address("bob")).await.expect("accept"));
    assert!(!alice.accept_new_identity(&address("bob")).await.expect("nothing pending"));
    alice.send_location(&address("bob"), &location).await.expect("send after consent");

    let report = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(report.stored, 1);
}

#[tokio::test]
async fn reinstalled_sender_is_held_until_accepted() {
    let world = SimWorld::new(10);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    alice.send_location(&address("bob"), &world.location(1.0, 1.0).expect("location")).await.expect("send");
    bob.receive_and_reconcile().await.expect("receive");

    alice.delete_device().await.expect("delete");
    alice.create_device().await.expect("recreate");
    alice.send_location(&address("bob"), &world.location(4.0, 4.0).expect("location")).await.expect("send");

    let mut events = bob.subscribe();
    let report = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(report.identity_changes, vec![address("alice")]);
    assert_eq!(report.deleted, 0);
    assert_eq!(world.directory.pending_messages(&address("bob")).len(), 1);

    let marker = bob.message(&address("alice")).expect("inbox read").expect("marker");
    assert_eq!(marker.payload, MessagePayload::Error(ErrorKind::AlteredIdentity));
    assert!(matches!(events.try_recv(), Ok(MessengerEvent::IdentityChanged { .. })));

    // Still held on the next cycle.
    let again = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(again.identity_changes, vec![address("alice")]);

    assert!(bob.accept_new_identity(&address("alice")).await.expect("accept"));
    let accepted = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(accepted.stored, 1);
    assert_eq!(accepted.deleted, 1);
    let stored = bob.message(&address("alice")).expect("inbox read").expect("stored");
    assert_eq!(stored.location().map(|l| l.latitude), Some(4.0));
}

#[tokio::test]
async fn live_shares_expire_and_can_be_renewed() {
    let world = SimWorld::new(11);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");
    let carol = world.device("carol", 1).await.expect("carol device");

    let now = world.env.wall_clock_ms();
    alice.start_live_sharing(&address("bob"), now + 60_000).expect("share bob");
    alice.start_live_sharing(&address("carol"), now + 600_000).expect("share carol");

    let report = alice.broadcast_location(&world.location(1.0, 1.0).expect("location")).await.expect("broadcast");
    assert_eq!(report.delivered.len(), 2);
    assert!(report.failed.is_empty());

    bob.receive_and_reconcile().await.expect("receive");
    let live = bob.message(&address("alice")).expect("inbox read").expect("stored");
    assert_eq!(live.location().and_then(|l| l.live_until_ms), Some(now + 60_000));
    assert!(bob.summaries().expect("summaries").entries[0].is_live);

    world.env.advance(Duration::from_secs(120));
    let report = alice.broadcast_location(&world.location(2.0, 2.0).expect("location")).await.expect("broadcast");
    assert_eq!(report.delivered, vec![address("carol")]);
    assert_eq!(alice.live_broadcasts().expect("shares").len(), 1);

    let later = world.env.wall_clock_ms() + 60_000;
    alice.start_live_sharing(&address("bob"), later).expect("renew");
    assert_eq!(alice.live_broadcasts().expect("shares").len(), 2);

    assert!(alice.stop_live_sharing(&address("carol")).expect("stop"));
    assert!(!alice.stop_live_sharing(&address("carol")).expect("already stopped"));

    let report = alice.broadcast_location(&world.location(3.0, 3.0).expect("location")).await.expect("broadcast");
    assert_eq!(report.delivered, vec![address("bob")]);
    carol.receive_and_reconcile().await.expect("receive");
    let carol_view = carol.message(&address("alice")).expect("inbox read").expect("stored");
    assert_eq!(carol_view.location().map(|l| l.latitude), Some(2.0));
}

#[tokio::test]
async fn live_sharing_repeats_until_the_share_expires() {
    let world = SimWorld::new(13);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    let start = world.env.wall_clock_ms();
    alice.start_live_sharing(&address("bob"), start + 60_000).expect("share bob");

    let rounds = alice
        .run_live_sharing(Duration::from_secs(15), |now_ms| {
            let step = (now_ms - start) / 15_000;
            pinpoint_proto::Location::new(step as f64, 0.0, 10, now_ms).expect("location")
        })
        .await
        .expect("live sharing");

    // Rounds at 0s, 15s, 30s and 45s; the share is over at 60s.
    assert_eq!(rounds, 4);
    assert_eq!(world.directory.pending_messages(&address("bob")).len(), 4);
    assert!(alice.live_broadcasts().expect("shares").is_empty());

    let report = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(report.stored, 4);
    let latest = bob.message(&address("alice")).expect("inbox read").expect("stored");
    assert_eq!(latest.location().map(|l| l.latitude), Some(3.0));
    assert_eq!(latest.location().and_then(|l| l.live_until_ms), Some(start + 60_000));
}

#[tokio::test]
async fn broadcast_failures_are_recorded_per_recipient() {
    let world = SimWorld::new(12);
    let alice = world.device("alice", 1).await.expect("alice device");
    world.device("bob", 1).await.expect("bob device");
    let mut events = alice.subscribe();

    let expiry = world.env.wall_clock_ms() + 60_000;
    alice.start_live_sharing(&address("bob"), expiry).expect("share");
    alice.start_live_sharing(&address("ghost"), expiry).expect("share");

    let report = alice.broadcast_location(&world.location(1.0, 1.0).expect("location")).await.expect("broadcast");
    assert_eq!(report.delivered, vec![address("bob")]);
    assert_eq!(report.failed, vec![(address("ghost"), ErrorKind::RecipientNotFound)]);

    assert_eq!(events.try_recv().expect("event"), MessengerEvent::BroadcastFailed {
        recipient: address("ghost"),
        kind: ErrorKind::RecipientNotFound,
    });

    let shares = alice.live_broadcasts().expect("shares");
    let ghost = shares.iter().find(|share| share.recipient == address("ghost")).expect("ghost share");
    assert_eq!(ghost.last_error, Some(ErrorKind::RecipientNotFound));
    let bob = shares.iter().find(|share| share.recipient == address("bob")).expect("bob share");
    assert_eq!(bob.last_error, None);
}

#[tokio::test]
async fn broadcast_aborts_when_credentials_are_rejected() {
    let world = SimWorld::new(13);
    let alice = world.device("alice", 1).await.expect("alice device");
    world.device("bob", 1).await.expect("bob device");
    world.device("carol", 1).await.expect("carol device");

    let expiry = world.env.wall_clock_ms() + 60_000;
    alice.start_live_sharing(&address("bob"), expiry).expect("share");
    alice.start_live_sharing(&address("carol"), expiry).expect("share");

    world.directory.fail_next(Request::FetchPreKeyBundle, RemoteError::Unauthorized);
    let error = alice
        .broadcast_location(&world.location(1.0, 1.0).expect("location"))
        .await
        .expect_err("aborted");

    assert_eq!(error.kind(), ErrorKind::Unauthorized);
    assert_eq!(world.directory.request_count(Request::FetchPreKeyBundle), 1);
}
