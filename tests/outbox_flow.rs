mod support;

use std::sync::Arc;
use std::time::Duration;

use support::{registration, relay_config, BrokerMode, FaultyStore, RecordingBroker};
use users_outbox::events::{EventCodec, Topic, UserEvent};
use users_outbox::models::{NewOutboxRecord, UserChanges};
use users_outbox::relay::{CycleOutcome, Relay, RelayError, RelayLane};
use users_outbox::scheduler::Scheduler;
use users_outbox::store::{InMemoryStore, OutboxStore};
use users_outbox::writer::{UserWriter, WriteError};

fn relay_over(store: &InMemoryStore, broker: &Arc<RecordingBroker>) -> Relay {
    Relay::new(Arc::new(store.clone()), broker.clone(), relay_config())
}

fn lane() -> RelayLane {
    RelayLane::all_topics()
}

#[tokio::test]
async fn test_registered_user_is_published_once_and_removed() {
    let store = InMemoryStore::new();
    let broker = RecordingBroker::new();
    let writer = UserWriter::new(Arc::new(store.clone()));
    let relay = relay_over(&store, &broker);

    let alice = writer.register(registration("alice")).await.unwrap();

    let report = relay.run_cycle(&lane()).await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(report.deleted, 1);

    let delivered = broker.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].topic, "user.created");
    assert_eq!(delivered[0].key, alice.user.id);
    assert_eq!(delivered[0].event_id, alice.event_id);

    let envelope = EventCodec::new().decode(&delivered[0].payload).unwrap();
    match envelope.event {
        UserEvent::Created(snapshot) => {
            assert_eq!(snapshot.username, "alice");
            assert_eq!(snapshot.roles, alice.user.roles);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!delivered[0].payload.contains("password"));
    assert!(store.outbox().await.is_empty());

    let second = relay.run_cycle(&lane()).await.unwrap();
    assert_eq!(second.fetched, 0);
    assert_eq!(broker.delivered().len(), 1);
}

#[tokio::test]
async fn test_broker_outage_keeps_records_until_recovery() {
    let store = InMemoryStore::new();
    let broker = RecordingBroker::new();
    let writer = UserWriter::new(Arc::new(store.clone()));
    let relay = relay_over(&store, &broker);

    writer.register(registration("alice")).await.unwrap();
    writer.register(registration("bob")).await.unwrap();

    broker.set_mode(BrokerMode::Fail);
    let report = relay.run_cycle(&lane()).await.unwrap();

    assert!(matches!(report.outcome, CycleOutcome::Aborted { .. }));
    assert_eq!(broker.attempts(), 1);
    assert_eq!(store.outbox().await.len(), 2);

    broker.set_mode(BrokerMode::Ack);
    let report = relay.run_cycle(&lane()).await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::Drained);
    assert_eq!(broker.delivered().len(), 2);
    assert!(store.outbox().await.is_empty());
}

#[tokio::test]
async fn test_missing_acknowledgement_times_out_without_delete() {
    let store = InMemoryStore::new();
    let broker = RecordingBroker::new();
    let writer = UserWriter::new(Arc::new(store.clone()));
    let relay = relay_over(&store, &broker);

    writer.register(registration("alice")).await.unwrap();
    broker.set_mode(BrokerMode::Hang);

    let report = tokio::time::timeout(Duration::from_secs(2), relay.run_cycle(&lane()))
        .await
        .expect("cycle must respect the publish timeout")
        .unwrap();

    assert!(matches!(report.outcome, CycleOutcome::Aborted { ref reason, .. } if reason.contains("acknowledgement")));
    assert_eq!(store.outbox().await.len(), 1);
}

#[tokio::test]
async fn test_failed_delete_after_ack_redelivers_same_event() {
    let memory = InMemoryStore::new();
    let store = FaultyStore::new(memory.clone());
    let broker = RecordingBroker::new();
    let writer = UserWriter::new(Arc::new(memory.clone()));
    let relay = Relay::new(Arc::new(store.clone()), broker.clone(), relay_config());

    writer.register(registration("alice")).await.unwrap();

    store.fail_deletes(true);
    let err = relay.run_cycle(&lane()).await.unwrap_err();
    assert!(matches!(err, RelayError::Store(_)));
    assert_eq!(broker.delivered().len(), 1);
    assert_eq!(memory.outbox().await.len(), 1);

    store.fail_deletes(false);
    relay.run_cycle(&lane()).await.unwrap();

    let delivered = broker.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].event_id, delivered[1].event_id);
    assert!(memory.outbox().await.is_empty());
}

#[tokio::test]
async fn test_events_for_one_user_keep_their_order() {
    let store = InMemoryStore::new();
    let broker = RecordingBroker::new();
    let writer = UserWriter::new(Arc::new(store.clone()));
    let relay = relay_over(&store, &broker);

    let alice = writer.register(registration("alice")).await.unwrap().user;
    writer.register(registration("bob")).await.unwrap();
    for email in ["alice@one.example", "alice@two.example"] {
        writer
            .update(
                alice.id,
                UserChanges {
                    email: Some(email.to_string()),
                    ..UserChanges::default()
                },
            )
            .await
            .unwrap();
    }
    writer.delete(alice.id).await.unwrap();

    relay.run_cycle(&lane()).await.unwrap();

    let codec = EventCodec::new();
    let alice_events: Vec<UserEvent> = broker
        .delivered()
        .iter()
        .filter(|m| m.key == alice.id)
        .map(|m| codec.decode(&m.payload).unwrap().event)
        .collect();

    assert_eq!(alice_events.len(), 4);
    assert!(matches!(alice_events[0], UserEvent::Created(_)));
    assert!(matches!(&alice_events[1], UserEvent::Updated(s) if s.email == "alice@one.example"));
    assert!(matches!(&alice_events[2], UserEvent::Updated(s) if s.email == "alice@two.example"));
    assert_eq!(alice_events[3], UserEvent::Deleted { id: alice.id });
}

#[tokio::test]
async fn test_poisoned_record_is_dead_lettered_without_blocking_others() {
    let store = InMemoryStore::new();
    let broker = RecordingBroker::new();
    let writer = UserWriter::new(Arc::new(store.clone()));
    let relay = relay_over(&store, &broker);

    let poisoned = store
        .enqueue_raw(NewOutboxRecord {
            topic: "user.created".to_string(),
            key: 999,
            payload: "not json".to_string(),
        })
        .await;
    writer.register(registration("bob")).await.unwrap();

    let first = relay.run_cycle(&lane()).await.unwrap();
    assert_eq!(first.outcome, CycleOutcome::Drained);
    assert_eq!(first.published, 1);
    assert_eq!(broker.delivered().len(), 1);

    relay.run_cycle(&lane()).await.unwrap();
    assert!(store.dead_letters(10).await.unwrap().is_empty());

    let third = relay.run_cycle(&lane()).await.unwrap();
    assert_eq!(third.dead_lettered, 1);

    let letters = store.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].outbox_id, poisoned);
    assert_eq!(letters[0].failed_attempts, 3);
    assert_eq!(letters[0].payload, "not json");
    assert!(store.outbox().await.is_empty());
}

#[tokio::test]
async fn test_failed_outbox_insert_rolls_back_the_user() {
    let memory = InMemoryStore::new();
    let store = FaultyStore::new(memory.clone());
    let writer = UserWriter::new(Arc::new(store.clone()));

    store.fail_outbox_inserts(true);
    let err = writer.register(registration("alice")).await.unwrap_err();

    assert!(matches!(err, WriteError::Store(_)));
    assert!(memory.users().await.is_empty());
    assert!(memory.outbox().await.is_empty());

    store.fail_outbox_inserts(false);
    writer.register(registration("alice")).await.unwrap();
    assert_eq!(memory.users().await.len(), 1);
    assert_eq!(memory.outbox().await.len(), 1);
}

#[tokio::test]
async fn test_second_relay_instance_waits_for_the_lease() {
    let store = InMemoryStore::new();
    let writer = UserWriter::new(Arc::new(store.clone()));
    let first_broker = RecordingBroker::new();
    let second_broker = RecordingBroker::new();
    let first = relay_over(&store, &first_broker);
    let second = relay_over(&store, &second_broker);

    writer.register(registration("alice")).await.unwrap();
    first.run_cycle(&lane()).await.unwrap();

    writer.register(registration("bob")).await.unwrap();
    let report = second.run_cycle(&lane()).await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::LeaseHeld);
    assert_eq!(second_broker.attempts(), 0);
    assert_eq!(store.outbox().await.len(), 1);

    first.release(&lane()).await.unwrap();
    let report = second.run_cycle(&lane()).await.unwrap();

    assert_eq!(report.published, 1);
    assert_eq!(first_broker.delivered().len(), 1);
    assert_eq!(second_broker.delivered().len(), 1);
}

#[tokio::test]
async fn test_cycle_stops_at_its_deadline() {
    let store = InMemoryStore::new();
    let writer = UserWriter::new(Arc::new(store.clone()));
    let broker = RecordingBroker::new();
    broker.set_delay(Duration::from_millis(100));

    let mut config = relay_config();
    config.cycle_timeout = Duration::from_millis(250);
    let relay = Relay::new(Arc::new(store.clone()), broker.clone(), config);

    for name in ["a", "b", "c", "d", "e"] {
        writer.register(registration(name)).await.unwrap();
    }

    let report = relay.run_cycle(&lane()).await.unwrap();

    assert!(matches!(
        report.outcome,
        CycleOutcome::Aborted { .. } | CycleOutcome::DeadlineReached
    ));
    assert!(report.published < 5);
    assert_eq!(store.outbox().await.len(), 5 - report.deleted);
}

#[tokio::test]
async fn test_scheduled_relay_drains_and_stops_cleanly() {
    let store = InMemoryStore::new();
    let writer = UserWriter::new(Arc::new(store.clone()));
    let broker = RecordingBroker::new();
    let relay = Arc::new(relay_over(&store, &broker));

    for name in ["alice", "bob", "carol"] {
        writer.register(registration(name)).await.unwrap();
    }

    let lanes = vec![lane()];
    let mut scheduler = Scheduler::new();
    relay.schedule(&mut scheduler, &lanes);
    scheduler.start();

    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while !store.outbox().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok());

    scheduler.shutdown().await;
    relay.release(&lanes[0]).await.unwrap();

    assert_eq!(broker.delivered().len(), 3);
}

#[tokio::test]
async fn test_single_and_per_topic_relays_exclude_each_other() {
    let store = InMemoryStore::new();
    let writer = UserWriter::new(Arc::new(store.clone()));
    let single_broker = RecordingBroker::new();
    let per_topic_broker = RecordingBroker::new();
    let single = relay_over(&store, &single_broker);
    let per_topic = relay_over(&store, &per_topic_broker);
    let created_lane = RelayLane::for_topic(Topic::UserCreated);

    // A slow broker keeps the single-lane cycle in flight while the other
    // instance tries its lane.
    single_broker.set_delay(Duration::from_millis(100));
    writer.register(registration("alice")).await.unwrap();

    let all = RelayLane::all_topics();
    let (single_report, per_topic_report) =
        tokio::join!(single.run_cycle(&all), per_topic.run_cycle(&created_lane));
    let (single_report, per_topic_report) = (single_report.unwrap(), per_topic_report.unwrap());

    assert_eq!(single_report.published + per_topic_report.published, 1);
    assert!(
        single_report.outcome == CycleOutcome::LeaseHeld || per_topic_report.outcome == CycleOutcome::LeaseHeld
    );
    assert_eq!(single_broker.delivered().len() + per_topic_broker.delivered().len(), 1);
    single.release(&all).await.unwrap();
    per_topic.release(&created_lane).await.unwrap();

    // The per-topic instance only takes over once the single lane lets go.
    writer.register(registration("bob")).await.unwrap();
    single.run_cycle(&all).await.unwrap();
    writer.register(registration("carol")).await.unwrap();
    assert_eq!(
        per_topic.run_cycle(&created_lane).await.unwrap().outcome,
        CycleOutcome::LeaseHeld
    );

    single.release(&all).await.unwrap();
    let report = per_topic.run_cycle(&created_lane).await.unwrap();
    assert_eq!(report.published, 1);
    assert!(store.outbox().await.is_empty());
}

#[tokio::test]
async fn test_payload_with_unknown_fields_is_never_published_stripped() {
    let store = InMemoryStore::new();
    let broker = RecordingBroker::new();
    let writer = UserWriter::new(Arc::new(store.clone()));
    let relay = relay_over(&store, &broker);

    let alice = writer.register(registration("alice")).await.unwrap();
    let stored = store.outbox().await.remove(0);
    store.delete(stored.id).await.unwrap();
    let extended = store
        .enqueue_raw(NewOutboxRecord {
            topic: stored.topic.clone(),
            key: stored.key,
            payload: stored
                .payload
                .replacen("\"username\":", "\"display_name\":\"Alice A.\",\"username\":", 1),
        })
        .await;

    for _ in 0..3 {
        relay.run_cycle(&lane()).await.unwrap();
    }

    assert_eq!(broker.attempts(), 0);
    let letters = store.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].outbox_id, extended);
    assert_eq!(letters[0].key, alice.user.id);
    assert!(letters[0].payload.contains("display_name"));
}

#[tokio::test]
async fn test_racing_registration_reports_taken_username() {
    let memory = InMemoryStore::new();
    let store = FaultyStore::new(memory.clone());
    let writer = UserWriter::new(Arc::new(store.clone()));

    writer.register(registration("alice")).await.unwrap();

    store.skip_existence_checks(true);
    let mut same_name = registration("alice");
    same_name.email = "other@example.com".to_string();
    let err = writer.register(same_name).await.unwrap_err();
    assert!(matches!(err, WriteError::UsernameTaken(name) if name == "alice"));

    let mut same_email = registration("alicia");
    same_email.email = "alice@example.com".to_string();
    let err = writer.register(same_email).await.unwrap_err();
    assert!(matches!(err, WriteError::EmailTaken(email) if email == "alice@example.com"));

    assert_eq!(memory.users().await.len(), 1);
    assert_eq!(memory.outbox().await.len(), 1);
}
