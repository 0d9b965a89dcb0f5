//! Tests for `Dispatcher::dispatch_pending`.

use std::sync::Arc;
use std::time::Duration;

use smsgate::address::AddressValidator;
use smsgate::dispatch::{DispatchSettings, INVALID_DESTINATION};
use smsgate::message::MessageStatus;
use smsgate::receipts::{AckOutcome, PartEventKind};
use smsgate::segment::Segmentation;
use smsgate::store::{MemoryMessageStore, MessageStore};

use super::support::{
    dispatcher, queue, settings, status_of, Interference, InterferingStore, RecordingTransport,
};

/// Accepts only the listed destinations.
struct AllowList(Vec<&'static str>);

impl AddressValidator for AllowList {
    fn is_well_formed(&self, destination: &str) -> bool {
        self.0.iter().any(|allowed| *allowed == destination)
    }
}

#[tokio::test]
async fn empty_queue_logs_one_event_and_changes_nothing() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let dispatcher = dispatcher(store.clone(), transport.clone(), settings(Segmentation::Manual));

    let summary = dispatcher.dispatch_pending().await.expect("cycle");

    assert_eq!(summary.fetched, 0);
    assert!(transport.transmissions().is_empty());
    let events = store.recent_events(10).await.expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message, "No SMS waiting to be sent.");
}

#[tokio::test]
async fn non_empty_batch_logs_its_size() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::new());
    queue(&*store, "m1", "+15550101", "one").await;
    queue(&*store, "m2", "+15550102", "two").await;
    let dispatcher = dispatcher(store.clone(), transport, settings(Segmentation::Manual));

    dispatcher.dispatch_pending().await.expect("cycle");

    let events = store.recent_events(10).await.expect("events");
    assert!(events.iter().any(|e| e.message == "Sending 2 SMSs..."));
}

#[tokio::test]
async fn dummy_mode_delivers_without_transmitting() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::new());
    queue(&*store, "dummy", "+15550101", "hello").await;
    let dispatcher = dispatcher(
        store.clone(),
        transport.clone(),
        DispatchSettings {
            dummy_send_mode: true,
            ..DispatchSettings::default()
        },
    );

    let summary = dispatcher.dispatch_pending().await.expect("cycle");

    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.parts_sent, 0);
    assert!(transport.transmissions().is_empty());
    assert_eq!(status_of(&*store, "dummy").await, MessageStatus::Delivered);
}

#[tokio::test]
async fn invalid_destination_fails_without_transmitting() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::new());
    queue(&*store, "bad", "call me maybe", "hello").await;
    let dispatcher = dispatcher(store.clone(), transport.clone(), settings(Segmentation::Manual));

    let summary = dispatcher.dispatch_pending().await.expect("cycle");

    assert_eq!(summary.failed, 1);
    assert!(transport.transmissions().is_empty());
    let message = store.get_message("bad").await.expect("get");
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.failure_reason.as_deref(), Some(INVALID_DESTINATION));

    let events = store.recent_events(10).await.expect("events");
    assert!(events
        .iter()
        .any(|e| e.message == "Not sending SMS to 'call me maybe' because number appears invalid"));
}

#[tokio::test]
async fn validator_is_pluggable() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::new());
    queue(&*store, "ok", "alice", "hi").await;
    queue(&*store, "no", "+15550101", "hi").await;
    let dispatcher = dispatcher(store.clone(), transport.clone(), settings(Segmentation::Manual))
        .with_validator(Arc::new(AllowList(vec!["alice"])));

    dispatcher.dispatch_pending().await.expect("cycle");

    assert_eq!(status_of(&*store, "ok").await, MessageStatus::Pending);
    assert_eq!(status_of(&*store, "no").await, MessageStatus::Failed);
    assert_eq!(transport.transmissions().len(), 1);
}

#[tokio::test]
async fn manual_mode_sends_numbered_parts_with_distinct_tokens() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::new());
    queue(&*store, "long", "+15550101", &"a".repeat(300)).await;
    let dispatcher = dispatcher(store.clone(), transport.clone(), settings(Segmentation::Manual));

    let summary = dispatcher.dispatch_pending().await.expect("cycle");

    assert_eq!(summary.parts_sent, 2);
    let sent = transport.transmissions();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].text, format!("1/2 {}", "a".repeat(136)));
    assert_eq!(sent[1].text, format!("2/2 {}", "a".repeat(164)));

    let mut tokens: Vec<_> = sent
        .iter()
        .flat_map(|t| [t.on_sent.token, t.on_delivered.token])
        .collect();
    tokens.sort_by_key(|t| t.0);
    tokens.dedup();
    assert_eq!(tokens.len(), 4, "every ticket carries its own token");

    for (index, t) in sent.iter().enumerate() {
        let index = u32::try_from(index).expect("small");
        assert_eq!(t.on_sent.kind, PartEventKind::Sent);
        assert_eq!(t.on_delivered.kind, PartEventKind::Delivered);
        assert_eq!(t.on_sent.part_index, index);
        assert_eq!(t.on_sent.total_parts, 2);
        assert_eq!(t.on_sent.message_id, "long");
    }

    assert_eq!(status_of(&*store, "long").await, MessageStatus::Pending);
    assert_eq!(dispatcher.receipts().pending_tickets(), 4);
}

#[tokio::test]
async fn native_mode_uses_transport_splitter() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::with_native_chunk(100));
    queue(&*store, "native", "+15550101", &"n".repeat(250)).await;
    let dispatcher = dispatcher(store.clone(), transport.clone(), settings(Segmentation::Native));

    dispatcher.dispatch_pending().await.expect("cycle");

    let sent = transport.transmissions();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].text, "n".repeat(100));
    assert_eq!(sent[2].text, "n".repeat(50));
    assert!(sent.iter().all(|t| t.on_delivered.total_parts == 3));
}

#[tokio::test]
async fn smsc_override_reaches_transport() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::new());
    queue(&*store, "smsc", "+15550101", "hi").await;
    let dispatcher = dispatcher(
        store.clone(),
        transport.clone(),
        DispatchSettings {
            smsc: Some("+15559999".to_owned()),
            ..DispatchSettings::default()
        },
    );

    dispatcher.dispatch_pending().await.expect("cycle");

    let sent = transport.transmissions();
    assert_eq!(sent[0].smsc.as_deref(), Some("+15559999"));
    assert_eq!(sent[0].destination, "+15550101");
}

#[tokio::test]
async fn transport_error_fails_only_that_message() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::failing_for("+15550666"));
    queue(&*store, "broken", "+15550666", "first").await;
    queue(&*store, "fine", "+15550101", "second").await;
    let dispatcher = dispatcher(store.clone(), transport.clone(), settings(Segmentation::Manual));

    let summary = dispatcher.dispatch_pending().await.expect("cycle");

    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.dispatched, 1);

    let broken = store.get_message("broken").await.expect("get");
    assert_eq!(broken.status, MessageStatus::Failed);
    let reason = broken.failure_reason.expect("failed messages carry a reason");
    assert!(reason.starts_with("Exception: TransportError; message: "), "{reason}");
    assert!(reason.contains("radio off"), "{reason}");

    assert_eq!(status_of(&*store, "fine").await, MessageStatus::Pending);
    assert_eq!(transport.transmissions().len(), 1);
    assert_eq!(dispatcher.receipts().outstanding("broken", PartEventKind::Sent), None);
}

#[tokio::test]
async fn batch_limit_bounds_each_cycle() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::new());
    for i in 0..15 {
        queue(&*store, &format!("m{i:02}"), "+15550101", "hi").await;
    }
    let dispatcher = dispatcher(store.clone(), transport.clone(), settings(Segmentation::Manual));
    assert_eq!(dispatcher.settings().batch_limit, 10);

    let first = dispatcher.dispatch_pending().await.expect("cycle");
    assert_eq!(first.fetched, 10);
    let unsent = store
        .get_messages(100, MessageStatus::Unsent)
        .await
        .expect("fetch");
    assert_eq!(unsent.len(), 5);
    assert_eq!(unsent[0].id, "m10", "oldest messages go first");

    let second = dispatcher.dispatch_pending().await.expect("cycle");
    assert_eq!(second.fetched, 5);
}

#[tokio::test]
async fn messages_claimed_elsewhere_are_skipped() {
    let inner = Arc::new(MemoryMessageStore::new());
    queue(&*inner, "taken", "+15550101", "hi").await;
    let store = Arc::new(InterferingStore::new(inner.clone(), Interference::StealClaims));
    let transport = Arc::new(RecordingTransport::new());
    let dispatcher = dispatcher(store, transport.clone(), settings(Segmentation::Manual));

    let summary = dispatcher.dispatch_pending().await.expect("cycle");

    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.skipped, 1);
    assert!(transport.transmissions().is_empty());
    assert_eq!(status_of(&*inner, "taken").await, MessageStatus::Pending);
}

#[tokio::test]
async fn dummy_mode_skips_messages_claimed_elsewhere() {
    let inner = Arc::new(MemoryMessageStore::new());
    queue(&*inner, "taken", "+15550101", "hi").await;
    let store = Arc::new(InterferingStore::new(inner.clone(), Interference::StealClaims));
    let dispatcher = dispatcher(
        store,
        Arc::new(RecordingTransport::new()),
        DispatchSettings {
            dummy_send_mode: true,
            ..DispatchSettings::default()
        },
    );

    let summary = dispatcher.dispatch_pending().await.expect("cycle");

    assert_eq!(summary.skipped, 1);
    assert_eq!(status_of(&*inner, "taken").await, MessageStatus::Pending);
}

#[tokio::test]
async fn dummy_mode_stops_when_another_writer_moves_the_message() {
    let inner = Arc::new(MemoryMessageStore::new());
    queue(&*inner, "cancelled", "+15550101", "hi").await;
    let store = Arc::new(InterferingStore::new(inner.clone(), Interference::FailAfterClaim));
    let dispatcher = dispatcher(
        store,
        Arc::new(RecordingTransport::new()),
        DispatchSettings {
            dummy_send_mode: true,
            ..DispatchSettings::default()
        },
    );

    let summary = dispatcher.dispatch_pending().await.expect("cycle");

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.dispatched, 0);
    let message = inner.get_message("cancelled").await.expect("get");
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.failure_reason.as_deref(), Some("cancelled by operator"));
}

#[tokio::test]
async fn overlapping_cycles_send_each_message_once() {
    let inner = Arc::new(MemoryMessageStore::new());
    for i in 0..6 {
        queue(&*inner, &format!("m{i}"), "+15550101", "hi").await;
    }
    // Yielding on every store call makes both cycles fetch before either claims.
    let store = Arc::new(InterferingStore::new(inner.clone(), Interference::Yield));
    let transport = Arc::new(RecordingTransport::new());
    let first = dispatcher(store.clone(), transport.clone(), settings(Segmentation::Manual));
    let second = dispatcher(store.clone(), transport.clone(), settings(Segmentation::Manual));

    let (a, b) = tokio::join!(first.dispatch_pending(), second.dispatch_pending());
    let (a, b) = (a.expect("cycle"), b.expect("cycle"));

    assert_eq!((a.fetched, b.fetched), (6, 6), "both cycles saw the whole queue");
    assert_eq!(a.dispatched.saturating_add(b.dispatched), 6);
    assert_eq!(a.skipped.saturating_add(b.skipped), 6);
    let mut ids: Vec<String> = transport
        .transmissions()
        .into_iter()
        .map(|t| t.on_sent.message_id)
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 6);
    assert_eq!(transport.transmissions().len(), 6);
}

#[tokio::test]
async fn settled_messages_stop_being_tracked() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::new());
    for i in 0..10 {
        queue(&*store, &format!("m{i}"), "+15550101", &"a".repeat(300)).await;
    }
    let dispatcher = dispatcher(store.clone(), transport, settings(Segmentation::Manual));
    let receipts = dispatcher.receipts();

    dispatcher.dispatch_pending().await.expect("cycle");
    assert_eq!(receipts.pending_tickets(), 40);
    assert_eq!(receipts.tracked_messages(), 10);

    // Settled out of band: no acknowledgement will ever arrive for these.
    for i in 0..10 {
        store
            .set_failed(&format!("m{i}"), "expired at carrier")
            .await
            .expect("fail");
    }
    dispatcher.dispatch_pending().await.expect("cycle");

    assert_eq!(receipts.pending_tickets(), 0);
    assert_eq!(receipts.tracked_messages(), 0);
}

#[tokio::test]
async fn tracking_is_bounded_by_receipt_ttl() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let dispatcher = dispatcher(
        store.clone(),
        transport,
        DispatchSettings {
            segmentation: Segmentation::Manual,
            receipt_ttl: Duration::ZERO,
            ..DispatchSettings::default()
        },
    );
    let receipts = dispatcher.receipts();

    for cycle in 0..5 {
        for i in 0..10 {
            queue(&*store, &format!("c{cycle}m{i}"), "+15550101", &"a".repeat(300)).await;
        }
        dispatcher.dispatch_pending().await.expect("cycle");
        // Only the batch sent this cycle is still tracked.
        assert_eq!(receipts.pending_tickets(), 40);
    }

    dispatcher.dispatch_pending().await.expect("cycle");
    assert_eq!(receipts.pending_tickets(), 0);
}

#[tokio::test]
async fn acknowledgements_drive_message_to_delivered() {
    let store = Arc::new(MemoryMessageStore::new());
    let transport = Arc::new(RecordingTransport::new());
    queue(&*store, "ack", "+15550101", &"a".repeat(300)).await;
    let dispatcher = dispatcher(store.clone(), transport.clone(), settings(Segmentation::Manual));
    dispatcher.dispatch_pending().await.expect("cycle");
    let receipts = dispatcher.receipts();
    let sent = transport.transmissions();

    let first = receipts.acknowledge(sent[0].on_sent.token).await.expect("ack");
    assert_eq!(first, AckOutcome::Recorded { remaining: 1 });
    assert_eq!(status_of(&*store, "ack").await, MessageStatus::Pending);

    let second = receipts.acknowledge(sent[1].on_sent.token).await.expect("ack");
    assert_eq!(second, AckOutcome::Completed { status: MessageStatus::Sent });
    assert_eq!(status_of(&*store, "ack").await, MessageStatus::Sent);

    receipts
        .acknowledge(sent[1].on_delivered.token)
        .await
        .expect("ack");
    let done = receipts
        .acknowledge(sent[0].on_delivered.token)
        .await
        .expect("ack");
    assert_eq!(done, AckOutcome::Completed { status: MessageStatus::Delivered });
    assert_eq!(status_of(&*store, "ack").await, MessageStatus::Delivered);
    assert_eq!(receipts.pending_tickets(), 0);
}
