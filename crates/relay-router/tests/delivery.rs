//! End-to-end router scenarios: direct delivery with ACK, broadcast with a
//! slow peer, channel fan-out, session replay, and re-registration.

use relay_protocol::{Envelope, EnvelopeKind, HelloPayload, SendPayload};
use relay_router::{Registration, Router, RouterConfig, ShadowBinding, OUTBOUND_BUFFER};
use relay_storage::{MemoryStore, MessageQuery, MessageStatus, MessageStore, SessionCloseReason};
use std::sync::Arc;
use std::time::Duration;

fn new_router() -> (Arc<Router>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let router = Router::new(store.clone() as Arc<dyn MessageStore>, RouterConfig::default());
    (router, store)
}

async fn register(router: &Arc<Router>, name: &str) -> Registration {
    router
        .register(&HelloPayload::new(name))
        .await
        .expect("registration")
}

fn send(from: &str, to: &str, body: &str) -> Envelope {
    Envelope::send(from, to, None, &SendPayload::message(body)).expect("send envelope")
}

#[tokio::test]
async fn direct_delivery_with_ack() {
    let (router, store) = new_router();
    let alice = register(&router, "alice").await;
    let mut bob = register(&router, "bob").await;

    let envelope = send("alice", "bob", "hi");
    let id = envelope.id;
    router.handle_envelope(&alice.connection.id, envelope).await;

    // Bob receives the DELIVER with seq 1 in his session.
    let deliver = bob.receiver.recv().await.expect("deliver");
    assert_eq!(deliver.kind, EnvelopeKind::Deliver);
    assert_eq!(deliver.id, id);
    assert_eq!(deliver.from.as_deref(), Some("alice"));
    assert_eq!(deliver.to.as_deref(), Some("bob"));
    let info = deliver.delivery_info().unwrap();
    assert_eq!(info.seq, 1);
    assert_eq!(info.session_id, bob.session_id);
    assert_eq!(deliver.send_payload().unwrap().body, "hi");

    assert_eq!(router.pending_count(), 1);

    // Bob ACKs; pending clears and the stored row advances to acked.
    let ack = Envelope::ack("bob", id).unwrap();
    router.handle_envelope(&bob.connection.id, ack).await;

    assert_eq!(router.pending_count(), 0);
    let row = store.get_message_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.message.status, MessageStatus::Acked);
}

#[tokio::test]
async fn sequences_increase_per_stream() {
    let (router, _store) = new_router();
    let alice = register(&router, "alice").await;
    let mut bob = register(&router, "bob").await;

    for body in ["one", "two", "three"] {
        router
            .handle_envelope(&alice.connection.id, send("alice", "bob", body))
            .await;
    }

    for expected_seq in 1..=3 {
        let deliver = bob.receiver.recv().await.unwrap();
        assert_eq!(deliver.delivery_info().unwrap().seq, expected_seq);
    }
}

#[tokio::test]
async fn unknown_recipient_is_soft_failure() {
    let (router, store) = new_router();
    let alice = register(&router, "alice").await;

    router
        .handle_envelope(&alice.connection.id, send("alice", "ghost", "anyone?"))
        .await;

    // Not persisted, not pending, router still healthy.
    assert_eq!(router.pending_count(), 0);
    let rows = store
        .get_messages(&MessageQuery::for_recipient("ghost"))
        .await
        .unwrap();
    assert!(rows.is_empty());
    assert_eq!(router.agent_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn broadcast_with_slow_peer_retries_then_exhausts() {
    let (router, store) = new_router();
    let alice = register(&router, "alice").await;
    let bob = register(&router, "bob").await;
    let mut charlie = register(&router, "charlie").await;

    // Fill bob's outbound buffer so sends to him are skipped.
    while bob.connection.send(Envelope::ping()) {}
    assert!(!bob.connection.send(Envelope::ping()));

    router
        .handle_envelope(&alice.connection.id, send("alice", "*", "fan out"))
        .await;

    // Charlie got his copy and ACKs it.
    let deliver = charlie.receiver.recv().await.unwrap();
    let id = deliver.id;
    router
        .handle_envelope(&charlie.connection.id, Envelope::ack("charlie", id).unwrap())
        .await;

    // Rows exist for both recipients.
    let bob_rows = store
        .get_messages(&MessageQuery::for_recipient("bob"))
        .await
        .unwrap();
    let charlie_rows = store
        .get_messages(&MessageQuery::for_recipient("charlie"))
        .await
        .unwrap();
    assert_eq!(bob_rows.len(), 1);
    assert_eq!(charlie_rows.len(), 1);
    assert!(bob_rows[0].message.is_broadcast);

    // Let the 2 s retries run out (5 attempts).
    tokio::time::sleep(Duration::from_secs(15)).await;
    tokio::task::yield_now().await;

    assert_eq!(router.pending_count(), 0);
    let bob_rows = store
        .get_messages(&MessageQuery::for_recipient("bob"))
        .await
        .unwrap();
    assert_eq!(bob_rows[0].message.status, MessageStatus::Unread);
    let charlie_rows = store
        .get_messages(&MessageQuery::for_recipient("charlie"))
        .await
        .unwrap();
    assert_eq!(charlie_rows[0].message.status, MessageStatus::Acked);
}

#[tokio::test]
async fn broadcast_excludes_sender() {
    let (router, _store) = new_router();
    let mut alice = register(&router, "alice").await;
    let mut bob = register(&router, "bob").await;

    router
        .handle_envelope(&alice.connection.id, send("alice", "*", "hello all"))
        .await;

    let deliver = bob.receiver.recv().await.unwrap();
    assert_eq!(deliver.send_payload().unwrap().body, "hello all");
    assert!(alice.receiver.try_recv().is_err());
}

#[tokio::test]
async fn topic_broadcast_reaches_subscribers_only() {
    let (router, _store) = new_router();
    let alice = register(&router, "alice").await;
    let mut bob = register(&router, "bob").await;
    let mut carol = register(&router, "carol").await;

    router.subscribe("bob", "builds");

    let envelope =
        Envelope::send("alice", "*", Some("builds"), &SendPayload::message("green")).unwrap();
    router.handle_envelope(&alice.connection.id, envelope).await;

    assert_eq!(
        bob.receiver.recv().await.unwrap().topic.as_deref(),
        Some("builds")
    );
    assert!(carol.receiver.try_recv().is_err());
}

#[tokio::test]
async fn channel_message_excludes_sender() {
    let (router, _store) = new_router();
    let mut alice = register(&router, "alice").await;
    let mut bob = register(&router, "bob").await;
    let mut carol = register(&router, "carol").await;

    for name in ["alice", "bob", "carol"] {
        router.channel_join(name, "#general");
    }
    // Drain the join notifications alice and bob received.
    while alice.receiver.try_recv().is_ok() {}
    while bob.receiver.try_recv().is_ok() {}

    let envelope = Envelope::channel(
        EnvelopeKind::ChannelMessage,
        "alice",
        &relay_protocol::ChannelPayload::message("#general", "hi"),
    )
    .unwrap();
    router.handle_envelope(&alice.connection.id, envelope).await;

    let to_bob = bob.receiver.recv().await.unwrap();
    assert_eq!(to_bob.kind, EnvelopeKind::ChannelMessage);
    assert_eq!(to_bob.channel_payload().unwrap().body.as_deref(), Some("hi"));

    let to_carol = carol.receiver.recv().await.unwrap();
    assert_eq!(to_carol.kind, EnvelopeKind::ChannelMessage);

    assert!(alice.receiver.try_recv().is_err());
}

#[tokio::test]
async fn empty_channel_is_garbage_collected() {
    let (router, _store) = new_router();
    let _alice = register(&router, "alice").await;

    router.channel_join("alice", "#ops");
    assert_eq!(router.channel_members("#ops"), vec!["alice".to_string()]);

    router.channel_leave("alice", "#ops");
    assert!(router.channel_members("#ops").is_empty());
}

#[tokio::test]
async fn session_replay_on_reconnect() {
    let (router, store) = new_router();
    let alice = register(&router, "alice").await;
    let mut bob = register(&router, "bob").await;
    let bob_session = bob.session_id.clone();

    let envelope = send("alice", "bob", "while you were out");
    let id = envelope.id;
    router.handle_envelope(&alice.connection.id, envelope).await;
    let original = bob.receiver.recv().await.unwrap();
    let original_seq = original.delivery_info().unwrap().seq;

    // Bob disconnects without ACKing: pending cleared, row stays unread.
    router
        .unregister(&bob.connection.id, SessionCloseReason::Disconnect)
        .await;
    assert_eq!(router.pending_count(), 0);
    let row = store.get_message_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.message.status, MessageStatus::Unread);

    // Reconnect with the same session id.
    let mut hello = HelloPayload::new("bob");
    hello.session_id = Some(bob_session.clone());
    let mut resumed = router.register(&hello).await.unwrap();
    assert!(resumed.resumed);
    assert_eq!(resumed.session_id, bob_session);
    assert_eq!(resumed.replayed, 1);

    // The replayed DELIVER keeps the original id and sequence.
    let replayed = resumed.receiver.recv().await.unwrap();
    assert_eq!(replayed.id, id);
    let info = replayed.delivery_info().unwrap();
    assert_eq!(info.seq, original_seq);
    assert_eq!(info.session_id, bob_session);

    // ACK transitions the row to acked.
    router
        .handle_envelope(&resumed.connection.id, Envelope::ack("bob", id).unwrap())
        .await;
    let row = store.get_message_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.message.status, MessageStatus::Acked);
}

#[tokio::test]
async fn reregistration_evicts_incumbent_and_clears_state() {
    let (router, _store) = new_router();
    let first = register(&router, "alice").await;
    router.subscribe("alice", "builds");
    router.bind_shadow("alice", ShadowBinding::observer("watcher"));

    // Same name registers again: the incumbent is evicted in the same
    // critical section that clears its subscriptions and shadows.
    let second = register(&router, "alice").await;

    assert_eq!(router.agent_count(), 1);
    assert!(first.connection.is_shutdown());
    assert!(!second.connection.is_shutdown());

    // The old subscription is gone: a topic broadcast reaches nobody.
    let bob = register(&router, "bob").await;
    let envelope =
        Envelope::send("bob", "*", Some("builds"), &SendPayload::message("ping")).unwrap();
    router.handle_envelope(&bob.connection.id, envelope).await;
    assert_eq!(router.pending_count(), 0);

    // The shadow binding did not survive either.
    assert!(router.primary_of("watcher").is_none());
}

#[tokio::test]
async fn ack_from_wrong_connection_is_ignored() {
    let (router, store) = new_router();
    let alice = register(&router, "alice").await;
    let mut bob = register(&router, "bob").await;
    let mallory = register(&router, "mallory").await;

    let envelope = send("alice", "bob", "secret");
    let id = envelope.id;
    router.handle_envelope(&alice.connection.id, envelope).await;
    let _ = bob.receiver.recv().await.unwrap();

    // Mallory tries to ACK bob's delivery.
    router
        .handle_envelope(&mallory.connection.id, Envelope::ack("mallory", id).unwrap())
        .await;

    assert_eq!(router.pending_count(), 1);
    let row = store.get_message_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.message.status, MessageStatus::Unread);
}

#[tokio::test]
async fn shadow_receives_tagged_copies() {
    let (router, store) = new_router();
    let alice = register(&router, "alice").await;
    let mut bob = register(&router, "bob").await;
    let mut watcher = register(&router, "watcher").await;

    router.bind_shadow("bob", ShadowBinding::observer("watcher"));

    let envelope = send("alice", "bob", "status?");
    let id = envelope.id;
    router.handle_envelope(&alice.connection.id, envelope).await;

    let primary = bob.receiver.recv().await.unwrap();
    assert_eq!(primary.id, id);

    let copy = watcher.receiver.recv().await.unwrap();
    // Fresh id, tagged payload, never tracked or persisted.
    assert_ne!(copy.id, id);
    let payload = copy.send_payload().unwrap();
    assert_eq!(
        payload.data_value(relay_protocol::SHADOW_COPY_KEY),
        Some(&serde_json::Value::Bool(true))
    );
    assert_eq!(
        payload.data_value(relay_protocol::SHADOW_OF_KEY),
        Some(&serde_json::Value::String("bob".into()))
    );
    assert_eq!(
        payload.data_value(relay_protocol::SHADOW_DIRECTION_KEY),
        Some(&serde_json::Value::String("incoming".into()))
    );

    assert_eq!(router.pending_count(), 1);
    assert!(store.get_message_by_id(copy.id).await.unwrap().is_none());
}

#[tokio::test]
async fn shadow_trigger_marks_processing() {
    let (router, _store) = new_router();
    let _primary = register(&router, "primary").await;
    let mut watcher = register(&router, "watcher").await;

    router.bind_shadow(
        "primary",
        ShadowBinding {
            shadow: "watcher".into(),
            speak_on: vec![relay_router::ShadowTrigger::AllMessages],
            receive_incoming: false,
            receive_outgoing: false,
        },
    );

    router.emit_shadow_trigger("primary", relay_router::ShadowTrigger::ExplicitAsk, None);

    let trigger = watcher.receiver.recv().await.unwrap();
    let payload = trigger.send_payload().unwrap();
    assert!(payload.body.starts_with("SHADOW_TRIGGER:"));
    assert_eq!(
        payload.data_value(relay_protocol::SHADOW_TRIGGER_KEY),
        Some(&serde_json::Value::String("EXPLICIT_ASK".into()))
    );

    let processing = router.processing_agents();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].agent, "watcher");
}

#[tokio::test(start_paused = true)]
async fn processing_clears_on_activity_or_timeout() {
    let (router, _store) = new_router();
    let alice = register(&router, "alice").await;
    let mut bob = register(&router, "bob").await;

    router
        .handle_envelope(&alice.connection.id, send("alice", "bob", "think about it"))
        .await;
    let deliver = bob.receiver.recv().await.unwrap();
    assert_eq!(router.processing_agents().len(), 1);

    // Bob responds (an ACK counts as activity): processing clears.
    router
        .handle_envelope(&bob.connection.id, Envelope::ack("bob", deliver.id).unwrap())
        .await;
    assert!(router.processing_agents().is_empty());

    // A second delivery left alone times out after 30 s.
    router
        .handle_envelope(&alice.connection.id, send("alice", "bob", "again"))
        .await;
    assert_eq!(router.processing_agents().len(), 1);
    tokio::time::sleep(Duration::from_secs(31)).await;
    tokio::task::yield_now().await;
    assert!(router.processing_agents().is_empty());
}

#[tokio::test]
async fn outbound_buffer_bound_matches_constant() {
    let (_router, _store) = new_router();
    // The backpressure contract the broadcast test relies on.
    assert!(OUTBOUND_BUFFER >= 16);
}
