//! Receive cycle bookkeeping and failure surfacing.
//!
//! Covers the delete ledger, deferred deletions, key maintenance as a side
//! effect of receiving, and the events raised for failures the application
//! must act on.

use std::time::Duration;

use pinpoint_client::{MessengerConfig, MessengerError, MessengerEvent};
use pinpoint_core::DeleteLedger;
use pinpoint_harness::{Request, SimWorld};
use pinpoint_proto::{DeleteOutcome, ErrorKind, PeerAddress, RemoteError};

fn address(name: &str) -> PeerAddress {
    PeerAddress::new(name, 1)
}

#[tokio::test]
async fn rejected_deletion_is_recorded_skipped_then_pruned() {
    let world = SimWorld::new(20);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    alice.send_location(&address("bob"), &world.location(1.0, 1.0).expect("location")).await.expect("send");
    let id = world.directory.pending_messages(&address("bob"))[0].id;
    world.directory.force_delete_outcome(id, DeleteOutcome::NotOwner);

    let first = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(first.stored, 1);
    assert_eq!(first.delete_rejected, 1);
    assert_eq!(DeleteLedger::new(bob.store()).len().expect("ledger"), 1);

    // The relay keeps returning it; it is neither decrypted nor deleted again.
    let second = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(second.fetched, 1);
    assert_eq!(second.skipped, 1);
    assert_eq!(second.stored + second.failed + second.duplicates, 0);
    assert_eq!(world.directory.request_count(Request::DeleteMessages), 1);
    let kept = bob.message(&address("alice")).expect("inbox read").expect("stored");
    assert!(kept.location().is_some());

    // Once the relay forgets it, so does the ledger.
    assert!(world.directory.drop_message(id));
    let third = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(third.fetched, 0);
    assert!(DeleteLedger::new(bob.store()).is_empty().expect("ledger"));
}

#[tokio::test]
async fn transient_delete_failure_is_retried_as_a_duplicate() {
    let world = SimWorld::new(21);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    alice.send_location(&address("bob"), &world.location(1.0, 1.0).expect("location")).await.expect("send");
    let id = world.directory.pending_messages(&address("bob"))[0].id;
    world.directory.force_delete_outcome(id, DeleteOutcome::ServerError);

    let first = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(first.delete_deferred, 1);
    assert!(DeleteLedger::new(bob.store()).is_empty().expect("ledger"));

    world.directory.clear_delete_outcome(id);
    let second = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(second.duplicates, 1);
    assert_eq!(second.stored, 0);
    assert_eq!(second.deleted, 1);
    assert_eq!(world.directory.delete_requests(), vec![vec![id], vec![id]]);

    let kept = bob.message(&address("alice")).expect("inbox read").expect("stored");
    assert_eq!(kept.location().map(|l| l.latitude), Some(1.0));
}

#[tokio::test]
async fn redelivered_older_message_never_replaces_a_newer_entry() {
    let world = SimWorld::new(30);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    alice.send_location(&address("bob"), &world.location(1.0, 1.0).expect("location")).await.expect("send");
    let first = world.directory.pending_messages(&address("bob"))[0].id;
    world.directory.force_delete_outcome(first, DeleteOutcome::ServerError);
    bob.receive_and_reconcile().await.expect("bob receive");

    bob.send_location(&address("alice"), &world.location(2.0, 2.0).expect("location")).await.expect("reply");
    alice.receive_and_reconcile().await.expect("alice receive");
    alice.send_location(&address("bob"), &world.location(3.0, 3.0).expect("location")).await.expect("send");
    let latest = world.directory.pending_messages(&address("bob")).last().expect("queued").id;
    assert!(latest > first);

    bob.receive_and_reconcile().await.expect("bob receive");
    let held = bob.message(&address("alice")).expect("inbox read").expect("stored");
    assert_eq!(held.id, latest);

    // Only the first message is still queued; it is deleted without touching
    // the inbox, however its ciphertext fares this time.
    world.directory.clear_delete_outcome(first);
    let pending: Vec<u64> = world.directory.pending_messages(&address("bob")).iter().map(|m| m.id).collect();
    assert_eq!(pending, vec![first]);
    let report = bob.receive_and_reconcile().await.expect("bob receive");
    assert_eq!(report.fetched, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.deleted, 1);

    let held = bob.message(&address("alice")).expect("inbox read").expect("stored");
    assert_eq!(held.id, latest);
    assert_eq!(held.location().map(|l| (l.latitude, l.longitude)), Some((3.0, 3.0)));
    assert!(world.directory.pending_messages(&address("bob")).is_empty());
}

#[tokio::test]
async fn failed_delete_request_fails_the_cycle() {
    let world = SimWorld::new(22);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    alice.send_location(&address("bob"), &world.location(1.0, 1.0).expect("location")).await.expect("send");
    world.directory.fail_next(Request::DeleteMessages, RemoteError::Server { status: 503 });

    let error = bob.receive_and_reconcile().await.expect_err("delete failed");
    assert_eq!(error.kind(), ErrorKind::ServerError);
    assert!(error.is_transient());

    // The location was stored before the delete; the retry sees a duplicate.
    let retry = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(retry.duplicates, 1);
    assert_eq!(retry.deleted, 1);
}

#[tokio::test]
async fn consumed_prekeys_are_replenished_after_receiving() {
    let world = SimWorld::new(23);
    let bob = world.device("bob", 1).await.expect("bob device");
    let bob_address = address("bob");
    assert_eq!(world.directory.prekey_count(&bob_address), 50);

    for name in ["alice", "carol", "dave"] {
        let sender = world.device(name, 1).await.expect("sender device");
        sender.send_location(&bob_address, &world.location(1.0, 1.0).expect("location")).await.expect("send");
    }
    assert_eq!(world.directory.prekey_count(&bob_address), 47);

    let report = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(report.stored, 3);
    assert!(report.maintenance_error.is_none());

    let held = bob.store().prekey_ids().expect("prekeys");
    assert_eq!(held.len(), 50);
    assert_eq!(held.last(), Some(&53));
    assert_eq!(world.directory.prekey_count(&bob_address), 50);
}

#[tokio::test]
async fn stale_signed_prekey_rotates_and_old_sessions_still_decrypt() {
    let world = SimWorld::new(24);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    alice.send_location(&address("bob"), &world.location(1.0, 1.0).expect("location")).await.expect("send");

    bob.run_maintenance().await.expect("fresh keys");
    assert_eq!(world.directory.request_count(Request::UploadSignedPreKey), 0);

    world.env.advance(Duration::from_secs(6 * 24 * 60 * 60));
    bob.run_maintenance().await.expect("rotation");
    assert_eq!(world.directory.signed_prekey_id(&address("bob")), Some(2));
    assert_eq!(bob.store().signed_prekey_ids().expect("signed prekeys"), vec![1, 2]);

    // Alice's handshake still names signed prekey 1, which is retained.
    let report = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(report.stored, 1);

    world.env.advance(Duration::from_secs(6 * 24 * 60 * 60));
    bob.run_maintenance().await.expect("second rotation");
    assert_eq!(bob.store().signed_prekey_ids().expect("signed prekeys"), vec![2, 3]);
}

#[tokio::test]
async fn signed_prekey_applied_despite_error_still_opens_messages() {
    let world = SimWorld::new(31);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");

    world.directory.fail_after_next(Request::UploadSignedPreKey, RemoteError::Server { status: 503 });
    world.env.advance(Duration::from_secs(6 * 24 * 60 * 60));
    let error = bob.run_maintenance().await.expect_err("upload reported failed");
    assert_eq!(error.kind(), ErrorKind::ServerError);
    assert_eq!(world.directory.signed_prekey_id(&address("bob")), Some(2));

    // Alice builds her handshake on the bundle the directory did store.
    let sent = world.location(4.0, 4.0).expect("location");
    alice.send_location(&address("bob"), &sent).await.expect("send");
    let report = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(report.stored, 1);
    assert_eq!(report.failed, 0);
    assert!(report.maintenance_error.is_none());
    let stored = bob.message(&address("alice")).expect("inbox read").expect("stored");
    assert_eq!(stored.location(), Some(&sent));

    // The retry re-sent the same key rather than minting a third.
    assert_eq!(world.directory.request_count(Request::UploadSignedPreKey), 2);
    assert_eq!(world.directory.signed_prekey_id(&address("bob")), Some(2));
    assert_eq!(bob.store().signed_prekey_ids().expect("signed prekeys"), vec![1, 2]);
}

#[tokio::test]
async fn prekeys_applied_despite_timeout_are_not_duplicated() {
    let world = SimWorld::new(32);
    let bob = world.device("bob", 1).await.expect("bob device");
    let bob_address = address("bob");

    for name in ["alice", "carol"] {
        let sender = world.device(name, 1).await.expect("sender device");
        sender.send_location(&bob_address, &world.location(1.0, 1.0).expect("location")).await.expect("send");
    }
    world.directory.fail_after_next(Request::UploadPreKeys, RemoteError::Timeout);

    let first = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(first.stored, 2);
    assert_eq!(first.maintenance_error, Some(ErrorKind::Network));
    assert_eq!(world.directory.prekey_count(&bob_address), 50);

    let second = bob.receive_and_reconcile().await.expect("receive");
    assert!(second.maintenance_error.is_none());
    assert_eq!(world.directory.prekey_count(&bob_address), 50);
    let held = bob.store().prekey_ids().expect("prekeys");
    assert_eq!(held.len(), 50);
    assert_eq!(held.last(), Some(&52));
    assert!(bob.store().pending_prekey_upload().expect("store read").is_empty());
}

#[tokio::test]
async fn maintenance_failure_does_not_fail_the_receive() {
    let world = SimWorld::new(25);
    let bob = world.device("bob", 1).await.expect("bob device");
    let mut events = bob.subscribe();

    world.env.advance(Duration::from_secs(6 * 24 * 60 * 60));
    world.directory.fail_next(Request::UploadSignedPreKey, RemoteError::Server { status: 500 });

    let report = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(report.maintenance_error, Some(ErrorKind::ServerError));
    assert_eq!(events.try_recv().expect("event"), MessengerEvent::MaintenanceFailed {
        kind: ErrorKind::ServerError,
    });
    assert_eq!(bob.store().signed_prekey_ids().expect("signed prekeys"), vec![1, 2]);
    assert_eq!(world.directory.signed_prekey_id(&address("bob")), Some(1));

    let retry = bob.receive_and_reconcile().await.expect("receive");
    assert!(retry.maintenance_error.is_none());
    assert_eq!(world.directory.signed_prekey_id(&address("bob")), Some(2));
}

#[tokio::test]
async fn rejected_credentials_raise_an_event() {
    let world = SimWorld::new(26);
    let bob = world.device("bob", 1).await.expect("bob device");
    let mut events = bob.subscribe();

    world.directory.fail_next(Request::FetchMessages, RemoteError::Unauthorized);
    let error = bob.receive_and_reconcile().await.expect_err("unauthorized");

    assert_eq!(error.kind(), ErrorKind::Unauthorized);
    assert!(!error.is_transient());
    assert_eq!(events.try_recv().expect("event"), MessengerEvent::Unauthorized);
}

#[tokio::test]
async fn replaced_device_is_reset_and_recreated() {
    let world = SimWorld::new(27);
    let alice = world.device("alice", 1).await.expect("alice device");
    let bob = world.device("bob", 1).await.expect("bob device");
    let mut events = bob.subscribe();

    alice.send_location(&address("bob"), &world.location(1.0, 1.0).expect("location")).await.expect("send");
    bob.receive_and_reconcile().await.expect("receive");

    assert!(world.directory.evict_device(&address("bob")));
    let error = bob.receive_and_reconcile().await.expect_err("device gone");
    assert_eq!(error.kind(), ErrorKind::RemoteDeviceChanged);
    assert_eq!(events.try_recv().expect("event"), MessengerEvent::RemoteDeviceChanged);

    let removed = bob.reset_local_state().await.expect("reset");
    assert!(removed > 0);
    assert!(!bob.has_local_device().expect("store read"));
    assert!(bob.message(&address("alice")).expect("inbox read").is_none());

    bob.create_device().await.expect("recreate");
    assert!(world.directory.has_device(&address("bob")));
    let report = bob.receive_and_reconcile().await.expect("receive");
    assert_eq!(report.fetched, 0);
}

#[tokio::test]
async fn stalled_request_times_out() {
    let config = MessengerConfig { request_timeout: Duration::from_millis(50), ..MessengerConfig::default() };
    let world = SimWorld::with_config(28, config);
    let bob = world.device("bob", 1).await.expect("bob device");

    world.directory.stall_next(Request::FetchMessages);
    let error = bob.receive_and_reconcile().await.expect_err("timed out");

    assert!(matches!(error, MessengerError::Remote(RemoteError::Timeout)));
    assert_eq!(error.kind(), ErrorKind::Network);
    assert!(error.is_transient());

    let report = bob.receive_and_reconcile().await.expect("next cycle answers");
    assert_eq!(report.fetched, 0);
}

#[tokio::test]
async fn receive_without_device_fails() {
    let world = SimWorld::new(29);
    let bob = world.messenger("bob", 1);

    let error = bob.receive_and_reconcile().await.expect_err("no device");
    assert!(matches!(error, MessengerError::NoLocalDevice));
    assert_eq!(world.directory.request_count(Request::FetchMessages), 0);
}
