//! End-to-end protocol flows through the processor.

use parking_lot::Mutex;
use relaymq_broker::connection::CloseMode;
use relaymq_broker::{
    AllowAll, Authenticator, BrokerConfig, ChannelConnection, Connection, ConnectionError,
    ConnectionId, PersistenceConfig, ProcessorError, ProtocolProcessor, StaticAuthenticator,
    StoreType,
};
use relaymq_core::{DeliveryStage, InFlightKey, PublishRecord, QoS, RetainedMessage};
use relaymq_proto::{
    ConnectRequest, ConnectReturnCode, Credentials, Outbound, PublishPacket, PublishRequest,
    SubscribeRequest, SubscribeReturnCode, SubscribeTopic, UnsubscribeRequest,
};
use relaymq_store::{
    DurableStore, KeyedRecord, MemoryStore, MemorySubscriptionIndex, SqliteStore, StoreError,
    StoreResult,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::{assert_err, assert_ok};

struct Harness {
    processor: Arc<ProtocolProcessor>,
    store: Arc<MemoryStore>,
    index: Arc<MemorySubscriptionIndex>,
}

struct Client {
    conn: Arc<ChannelConnection>,
    rx: UnboundedReceiver<Outbound>,
}

impl Client {
    fn drain(&mut self) -> Vec<Outbound> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn publishes(&mut self) -> Vec<PublishPacket> {
        self.drain()
            .into_iter()
            .filter_map(|message| match message {
                Outbound::Publish(packet) => Some(packet),
                _ => None,
            })
            .collect()
    }
}

fn harness() -> Harness {
    harness_with(BrokerConfig::default(), Arc::new(AllowAll))
}

fn harness_with(config: BrokerConfig, authenticator: Arc<dyn Authenticator>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySubscriptionIndex::new());
    let processor = Arc::new(ProtocolProcessor::new(
        config,
        store.clone(),
        index.clone(),
        authenticator,
    ));
    Harness {
        processor,
        store,
        index,
    }
}

impl Harness {
    fn open(&self, request: ConnectRequest) -> Client {
        let (conn, rx) = ChannelConnection::new();
        assert_ok!(self.processor.process_connect(conn.clone(), request));
        Client { conn, rx }
    }

    /// Connect and consume everything up to and including the CONNACK.
    fn connect(&self, client_id: &str, clean: bool) -> Client {
        let mut client = self.open(ConnectRequest::new(3, client_id, clean));
        let messages = client.drain();
        assert_eq!(
            messages.last(),
            Some(&Outbound::ConnAck(ConnectReturnCode::Accepted))
        );
        client
    }

    fn subscribe(&self, client: &mut Client, client_id: &str, filter: &str, qos: QoS) {
        assert_ok!(self.processor.process_subscribe(
            client_id,
            SubscribeRequest {
                message_id: 1,
                topics: vec![SubscribeTopic {
                    filter: filter.to_string(),
                    qos,
                }],
            },
        ));
        client.drain();
    }

    fn disconnect(&self, client: &Client, client_id: &str) {
        assert_ok!(self
            .processor
            .process_disconnect(client.conn.as_ref(), client_id));
    }
}

fn publish(topic: &str, qos: QoS, message_id: Option<u16>, payload: &[u8]) -> PublishRequest {
    PublishRequest {
        topic: topic.to_string(),
        qos,
        payload: payload.to_vec(),
        retain: false,
        message_id,
    }
}

/// Connection that snapshots the store's in-flight keys on every write.
struct SnapshotConnection {
    id: ConnectionId,
    store: Arc<MemoryStore>,
    seen: Mutex<Vec<(Outbound, Vec<InFlightKey>)>>,
}

impl Connection for SnapshotConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn write(&self, message: Outbound) -> Result<(), ConnectionError> {
        let keys = self.store.in_flight_keys();
        self.seen.lock().push((message, keys));
        Ok(())
    }

    fn close(&self, _graceful: bool) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn set_idle_timeout(&self, _timeout: Duration) {}
}

/// Memory store whose `add_in_flight` can be switched to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_in_flight: AtomicBool,
}

impl DurableStore for FlakyStore {
    fn add_in_flight(&self, key: &InFlightKey, record: &PublishRecord) -> StoreResult<()> {
        if self.fail_in_flight.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("disk full".into()));
        }
        self.inner.add_in_flight(key, record)
    }

    fn clean_in_flight(&self, key: &InFlightKey) -> StoreResult<PublishRecord> {
        self.inner.clean_in_flight(key)
    }

    fn in_flight(&self, key: &InFlightKey) -> StoreResult<Option<PublishRecord>> {
        self.inner.in_flight(key)
    }

    fn in_flight_for_client(&self, client_id: &str) -> StoreResult<Vec<KeyedRecord>> {
        self.inner.in_flight_for_client(client_id)
    }

    fn persist_qos2(&self, key: &InFlightKey, record: &PublishRecord) -> StoreResult<()> {
        self.inner.persist_qos2(key, record)
    }

    fn retrieve_qos2(&self, key: &InFlightKey) -> StoreResult<PublishRecord> {
        self.inner.retrieve_qos2(key)
    }

    fn remove_qos2(&self, key: &InFlightKey) -> StoreResult<()> {
        self.inner.remove_qos2(key)
    }

    fn store_retained(&self, topic: &str, payload: &[u8], qos: QoS) -> StoreResult<()> {
        self.inner.store_retained(topic, payload, qos)
    }

    fn store_for_future(&self, record: &PublishRecord) -> StoreResult<()> {
        self.inner.store_for_future(record)
    }

    fn take_queued(&self, client_id: &str) -> StoreResult<Vec<PublishRecord>> {
        self.inner.take_queued(client_id)
    }

    fn search_retained(
        &self,
        condition: &dyn Fn(&str) -> bool,
    ) -> StoreResult<Vec<RetainedMessage>> {
        self.inner.search_retained(condition)
    }

    fn clean_persisted_for_client(&self, client_id: &str) -> StoreResult<()> {
        self.inner.clean_persisted_for_client(client_id)
    }
}

/// Connection whose close is always interrupted.
struct InterruptedConnection {
    id: ConnectionId,
}

impl Connection for InterruptedConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn write(&self, _message: Outbound) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn close(&self, _graceful: bool) -> Result<(), ConnectionError> {
        Err(ConnectionError::Interrupted)
    }

    fn set_idle_timeout(&self, _timeout: Duration) {}
}

#[test]
fn qos1_in_flight_record_spans_fan_out_until_ack() {
    let h = harness();
    let mut publisher = h.connect("pub", true);

    let snapshot = Arc::new(SnapshotConnection {
        id: ConnectionId::new(),
        store: h.store.clone(),
        seen: Mutex::new(Vec::new()),
    });
    assert_ok!(h
        .processor
        .process_connect(snapshot.clone(), ConnectRequest::new(3, "sub", true)));
    assert_ok!(h.processor.process_subscribe(
        "sub",
        SubscribeRequest {
            message_id: 1,
            topics: vec![SubscribeTopic {
                filter: "sensors/+".into(),
                qos: QoS::AtLeastOnce,
            }],
        },
    ));
    snapshot.seen.lock().clear();

    assert!(h.store.in_flight_keys().is_empty());
    assert_ok!(h.processor.process_publish(
        "pub",
        publish("sensors/t1", QoS::AtLeastOnce, Some(7), b"21.5")
    ));

    let seen = snapshot.seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(matches!(&seen[0].0, Outbound::Publish(p) if p.payload == b"21.5"));
    assert_eq!(seen[0].1, vec![InFlightKey::new("pub", 7)]);

    assert!(h.store.in_flight_keys().is_empty());
    assert_eq!(publisher.drain(), vec![Outbound::PubAck(7)]);
}

#[test]
fn qos2_tracks_sender_and_receiver_handshakes_independently() {
    let h = harness();
    let mut publisher = h.connect("pub", true);
    let mut subscriber = h.connect("sub", true);
    h.subscribe(&mut subscriber, "sub", "cmd/#", QoS::ExactlyOnce);

    assert_ok!(h.processor.process_publish(
        "pub",
        publish("cmd/reboot", QoS::ExactlyOnce, Some(3), b"now")
    ));
    assert_eq!(publisher.drain(), vec![Outbound::PubRec(3)]);
    assert!(subscriber.drain().is_empty());
    assert_eq!(h.store.qos2_keys(), vec![InFlightKey::new("pub", 3)]);
    assert!(h.store.in_flight_keys().is_empty());

    assert_ok!(h.processor.process_pub_rel("pub", 3));
    assert_eq!(publisher.drain(), vec![Outbound::PubComp(3)]);
    assert!(h.store.qos2_keys().is_empty());

    let delivered = subscriber.publishes();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].qos, QoS::ExactlyOnce);
    let forward_id = delivered[0].message_id.unwrap();
    let forward = InFlightKey::new("sub", forward_id);
    assert_eq!(h.store.in_flight_keys(), vec![forward.clone()]);

    assert_ok!(h.processor.process_pub_rec("sub", forward_id));
    assert_eq!(subscriber.drain(), vec![Outbound::PubRel(forward_id)]);
    assert_eq!(h.store.in_flight_keys(), vec![forward]);

    assert_ok!(h.processor.process_pub_comp("sub", forward_id));
    assert!(h.store.in_flight_keys().is_empty());

    let err = assert_err!(h.processor.process_pub_comp("sub", forward_id));
    assert!(matches!(err, ProcessorError::MissingInFlight { .. }));
}

#[test]
fn release_without_stored_publish_is_named_error() {
    let h = harness();
    let mut publisher = h.connect("pub", true);

    let err = assert_err!(h.processor.process_pub_rel("pub", 42));
    match err {
        ProcessorError::MissingQos2 { key } => assert_eq!(key, InFlightKey::new("pub", 42)),
        other => panic!("unexpected {other:?}"),
    }
    assert!(publisher.drain().is_empty());
}

#[test]
fn unsupported_protocol_version_closes_without_session() {
    let h = harness();
    let mut client = h.open(ConnectRequest::new(4, "c", true));

    assert_eq!(
        client.drain(),
        vec![Outbound::ConnAck(
            ConnectReturnCode::UnacceptableProtocolVersion
        )]
    );
    assert_eq!(client.conn.close_mode(), Some(CloseMode::Graceful));
    assert!(h.processor.sessions().is_empty());
}

#[test]
fn overlong_client_id_is_rejected_without_eviction() {
    let h = harness();
    let existing = h.connect("abcdefghijklmnopqrstuvw", true);

    let mut rejected = h.open(ConnectRequest::new(3, "abcdefghijklmnopqrstuvwx", true));
    assert_eq!(
        rejected.drain(),
        vec![Outbound::ConnAck(ConnectReturnCode::IdentifierRejected)]
    );
    assert!(!rejected.conn.is_closed());

    assert_eq!(h.processor.sessions().len(), 1);
    assert!(h.processor.sessions().contains("abcdefghijklmnopqrstuvw"));
    assert!(!existing.conn.is_closed());
}

#[test]
fn missing_client_id_is_rejected() {
    let h = harness();
    let mut request = ConnectRequest::new(3, "", true);
    request.client_id = None;
    let mut rejected = h.open(request);

    assert_eq!(
        rejected.drain(),
        vec![Outbound::ConnAck(ConnectReturnCode::IdentifierRejected)]
    );
    assert!(h.processor.sessions().is_empty());
}

#[test]
fn clean_reconnect_evicts_old_connection_and_subscriptions() {
    let h = harness();
    let mut first = h.connect("dev", true);
    h.subscribe(&mut first, "dev", "alerts/#", QoS::AtLeastOnce);
    assert_eq!(h.index.for_client("dev").len(), 1);

    let mut second = h.connect("dev", true);

    assert_eq!(first.conn.close_mode(), Some(CloseMode::Graceful));
    assert!(h.index.for_client("dev").is_empty());
    assert_eq!(
        h.processor.sessions().get("dev").unwrap().connection_id(),
        second.conn.id()
    );

    let _publisher = h.connect("pub", true);
    assert_ok!(h
        .processor
        .process_publish("pub", publish("alerts/fire", QoS::AtMostOnce, None, b"!")));
    assert!(second.publishes().is_empty());
}

#[test]
fn persistent_reconnect_keeps_subscriptions_and_republishes() {
    let h = harness();
    let mut first = h.connect("dev", false);
    h.subscribe(&mut first, "dev", "jobs/+", QoS::AtLeastOnce);

    let stored = PublishRecord {
        topic: "jobs/1".into(),
        qos: QoS::AtLeastOnce,
        payload: b"build".to_vec(),
        retain: false,
        client_id: "dev".into(),
        message_id: None,
        stage: DeliveryStage::Sent,
    };
    assert_ok!(h.store.store_for_future(&stored));

    let mut second = h.open(ConnectRequest::new(3, "dev", false));
    let messages = second.drain();

    assert_eq!(first.conn.close_mode(), Some(CloseMode::Graceful));
    assert_eq!(messages.len(), 2);
    let Outbound::Publish(packet) = &messages[0] else {
        panic!("unexpected {:?}", messages[0]);
    };
    assert_eq!(packet.payload, b"build");
    let message_id = packet.message_id.unwrap();
    assert_eq!(
        messages[1],
        Outbound::ConnAck(ConnectReturnCode::Accepted)
    );

    let subscriptions = h.index.for_client("dev");
    assert_eq!(subscriptions.len(), 1);
    assert!(subscriptions[0].active);
    assert_eq!(
        h.store.in_flight_keys(),
        vec![InFlightKey::new("dev", message_id)]
    );

    assert_ok!(h.processor.process_pub_ack("dev", message_id));
    assert!(h.store.in_flight_keys().is_empty());
}

#[test]
fn retained_replay_is_not_tracked_in_flight() {
    let h = harness();
    let _publisher = h.connect("pub", true);
    let mut request = publish("rooms/kitchen", QoS::AtLeastOnce, Some(2), b"on");
    request.retain = true;
    assert_ok!(h.processor.process_publish("pub", request));

    let mut subscriber = h.connect("sub", true);
    assert_ok!(h.processor.process_subscribe(
        "sub",
        SubscribeRequest {
            message_id: 9,
            topics: vec![SubscribeTopic {
                filter: "rooms/+".into(),
                qos: QoS::AtLeastOnce,
            }],
        },
    ));

    let messages = subscriber.drain();
    assert_eq!(messages.len(), 2);
    match &messages[0] {
        Outbound::Publish(packet) => {
            assert_eq!(packet.topic, "rooms/kitchen");
            assert_eq!(packet.payload, b"on");
            assert!(packet.retain);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        messages[1],
        Outbound::SubAck {
            message_id: 9,
            return_codes: vec![SubscribeReturnCode::Granted(QoS::AtMostOnce)],
        }
    );
    assert!(h.store.in_flight_keys().is_empty());
}

#[test]
fn retained_qos0_is_stored_without_subscribers() {
    let h = harness();
    let mut request = publish("lobby/temp", QoS::AtMostOnce, None, b"19");
    request.retain = true;

    assert_ok!(h.processor.process_publish("pub", request));

    let retained = h.store.retained("lobby/temp").unwrap();
    assert_eq!(retained.payload, b"19");
    assert_eq!(retained.qos, QoS::AtMostOnce);

    let mut clear = publish("lobby/temp", QoS::AtMostOnce, None, b"");
    clear.retain = true;
    assert_ok!(h.processor.process_publish("pub", clear));
    assert!(h.store.retained("lobby/temp").is_none());
}

#[test]
fn unsubscribe_unknown_filter_is_acknowledged() {
    let h = harness();
    let mut client = h.connect("c", true);

    assert_ok!(h.processor.process_unsubscribe(
        "c",
        UnsubscribeRequest {
            message_id: 17,
            filters: vec!["never/subscribed".into()],
        },
    ));
    assert_eq!(client.drain(), vec![Outbound::UnsubAck(17)]);
}

#[test]
fn offline_durable_subscriber_receives_queued_publish_on_reconnect() {
    let h = harness();
    let mut a = h.connect("A", false);
    h.subscribe(&mut a, "A", "a/b", QoS::AtLeastOnce);
    h.disconnect(&a, "A");
    assert!(!h.index.for_client("A")[0].active);

    let mut b = h.connect("B", true);
    assert_ok!(h
        .processor
        .process_publish("B", publish("a/b", QoS::AtLeastOnce, Some(5), b"x")));
    assert_eq!(b.drain(), vec![Outbound::PubAck(5)]);

    assert!(a.drain().is_empty());
    let queued = h.store.queued_for("A");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].payload, b"x");

    let mut a = h.open(ConnectRequest::new(3, "A", false));
    let delivered = a.publishes();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].topic, "a/b");
    assert_eq!(delivered[0].payload, b"x");
    assert!(h.store.queued_for("A").is_empty());
}

#[test]
fn queued_publishes_survive_restart_with_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relaymq.db");

    {
        let store = Arc::new(assert_ok!(SqliteStore::open(&path)));
        let processor = ProtocolProcessor::new(
            BrokerConfig::default(),
            store,
            Arc::new(MemorySubscriptionIndex::new()),
            Arc::new(AllowAll),
        );
        let (a, _arx) = ChannelConnection::new();
        assert_ok!(processor.process_connect(a.clone(), ConnectRequest::new(3, "A", false)));
        assert_ok!(processor.process_subscribe(
            "A",
            SubscribeRequest {
                message_id: 1,
                topics: vec![SubscribeTopic {
                    filter: "a/#".into(),
                    qos: QoS::ExactlyOnce,
                }],
            },
        ));
        assert_ok!(processor.process_disconnect(a.as_ref(), "A"));

        let (b, _brx) = ChannelConnection::new();
        assert_ok!(processor.process_connect(b, ConnectRequest::new(3, "B", true)));
        assert_ok!(processor.process_publish("B", publish("a/b", QoS::AtLeastOnce, Some(9), b"kept")));
    }

    let store = Arc::new(assert_ok!(SqliteStore::open(&path)));
    assert_eq!(assert_ok!(store.list_queued()).len(), 1);

    let processor = ProtocolProcessor::new(
        BrokerConfig::default(),
        store.clone(),
        Arc::new(MemorySubscriptionIndex::new()),
        Arc::new(AllowAll),
    );
    let (a, mut rx) = ChannelConnection::new();
    assert_ok!(processor.process_connect(a, ConnectRequest::new(3, "A", false)));

    match rx.try_recv().unwrap() {
        Outbound::Publish(packet) => {
            assert_eq!(packet.payload, b"kept");
            assert_eq!(packet.qos, QoS::AtLeastOnce);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(assert_ok!(store.list_queued()).is_empty());
    assert_eq!(assert_ok!(store.list_in_flight()).len(), 1);
}

#[test]
fn bad_credentials_leave_registration_in_place() {
    let users = HashMap::from([("alice".to_string(), "secret".to_string())]);
    let h = harness_with(
        BrokerConfig::default(),
        Arc::new(StaticAuthenticator::new(users)),
    );

    let mut request = ConnectRequest::new(3, "dev", true);
    request.credentials = Some(Credentials {
        username: "alice".into(),
        password: Some("guess".into()),
    });
    let mut client = h.open(request);

    assert_eq!(
        client.drain(),
        vec![Outbound::ConnAck(ConnectReturnCode::BadUsernameOrPassword)]
    );
    assert!(!client.conn.is_closed());
    assert!(h.processor.sessions().contains("dev"));
}

#[test]
fn keep_alive_sets_idle_timeout() {
    let h = harness();
    let mut request = ConnectRequest::new(3, "c", true);
    request.keep_alive = 20;
    let client = h.open(request);

    assert_eq!(client.conn.idle_timeout(), Some(Duration::from_secs(30)));
}

#[test]
fn interrupted_close_is_propagated() {
    let h = harness();
    let conn = Arc::new(InterruptedConnection {
        id: ConnectionId::new(),
    });
    assert_ok!(h
        .processor
        .process_connect(conn.clone(), ConnectRequest::new(3, "c", false)));

    let err = assert_err!(h.processor.process_disconnect(conn.as_ref(), "c"));
    assert!(matches!(
        err,
        ProcessorError::Connection(ConnectionError::Interrupted)
    ));
    assert!(!h.processor.sessions().contains("c"));
}

#[test]
fn stale_disconnect_leaves_new_session_alone() {
    let h = harness();
    let mut old = h.connect("dev", false);
    h.subscribe(&mut old, "dev", "t", QoS::AtLeastOnce);
    let new = h.connect("dev", false);

    h.disconnect(&old, "dev");

    assert_eq!(
        h.processor.sessions().get("dev").unwrap().connection_id(),
        new.conn.id()
    );
    assert!(h.index.for_client("dev")[0].active);
}

#[test]
fn dropped_forward_does_not_affect_sender_ack() {
    let h = harness();
    let mut publisher = h.connect("pub", true);
    let mut subscriber = h.connect("sub", true);
    h.subscribe(&mut subscriber, "sub", "t", QoS::AtLeastOnce);
    assert_ok!(subscriber.conn.close(false));

    assert_ok!(h
        .processor
        .process_publish("pub", publish("t", QoS::AtLeastOnce, Some(1), b"x")));
    assert_eq!(publisher.drain(), vec![Outbound::PubAck(1)]);
    assert!(h.store.in_flight_keys().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_complete_every_handshake() {
    let h = harness();
    let mut subscriber = h.connect("sub", true);
    h.subscribe(&mut subscriber, "sub", "load/#", QoS::AtLeastOnce);

    let mut handles = Vec::new();
    for n in 0..8u16 {
        let processor = h.processor.clone();
        handles.push(tokio::spawn(async move {
            let client_id = format!("pub-{n}");
            let (conn, _rx) = ChannelConnection::new();
            processor
                .process_connect(conn, ConnectRequest::new(3, client_id.as_str(), true))
                .unwrap();
            for id in 1..=50u16 {
                processor
                    .process_publish(
                        &client_id,
                        publish(&format!("load/{n}"), QoS::AtLeastOnce, Some(id), b"p"),
                    )
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(subscriber.publishes().len(), 400);
    assert!(h.store.in_flight_keys().is_empty());
}

#[test]
fn sqlite_config_builds_processor() {
    let dir = tempfile::tempdir().unwrap();
    let config = BrokerConfig {
        persistence: PersistenceConfig {
            store_type: StoreType::Sqlite,
            db_path: dir.path().join("state.db"),
        },
        ..BrokerConfig::default()
    };
    let processor = assert_ok!(relaymq_broker::build_processor(config));
    assert!(processor.sessions().is_empty());
}

#[test]
fn unacknowledged_redelivery_is_resent_after_another_drop() {
    let h = harness();
    let mut a = h.connect("A", false);
    h.subscribe(&mut a, "A", "a/b", QoS::AtLeastOnce);
    h.disconnect(&a, "A");

    let _b = h.connect("B", true);
    assert_ok!(h
        .processor
        .process_publish("B", publish("a/b", QoS::AtLeastOnce, Some(5), b"x")));

    let mut a = h.open(ConnectRequest::new(3, "A", false));
    let first = a.publishes();
    assert_eq!(first.len(), 1);
    assert!(!first[0].dup);
    let message_id = first[0].message_id.unwrap();

    h.disconnect(&a, "A");
    let mut a = h.open(ConnectRequest::new(3, "A", false));
    let again = a.publishes();
    assert_eq!(again.len(), 1);
    assert!(again[0].dup);
    assert_eq!(again[0].message_id, Some(message_id));
    assert_eq!(again[0].payload, b"x");

    assert_ok!(h.processor.process_pub_ack("A", message_id));
    assert!(h.store.in_flight_keys().is_empty());

    h.disconnect(&a, "A");
    let mut a = h.open(ConnectRequest::new(3, "A", false));
    assert!(a.publishes().is_empty());
}

#[test]
fn released_forward_gets_pubrel_again_on_reconnect() {
    let h = harness();
    let mut s = h.connect("S", false);
    h.subscribe(&mut s, "S", "cmd", QoS::ExactlyOnce);

    let _p = h.connect("P", true);
    assert_ok!(h
        .processor
        .process_publish("P", publish("cmd", QoS::ExactlyOnce, Some(1), b"go")));
    assert_ok!(h.processor.process_pub_rel("P", 1));
    let message_id = s.publishes()[0].message_id.unwrap();

    assert_ok!(h.processor.process_pub_rec("S", message_id));
    assert_eq!(s.drain(), vec![Outbound::PubRel(message_id)]);
    h.disconnect(&s, "S");

    let mut s = h.open(ConnectRequest::new(3, "S", false));
    assert_eq!(
        s.drain(),
        vec![
            Outbound::PubRel(message_id),
            Outbound::ConnAck(ConnectReturnCode::Accepted),
        ]
    );

    assert_ok!(h.processor.process_pub_comp("S", message_id));
    assert!(h.store.in_flight_keys().is_empty());
}

#[test]
fn equal_publisher_ids_get_distinct_forward_ids() {
    let h = harness();
    let mut s = h.connect("S", true);
    h.subscribe(&mut s, "S", "t", QoS::ExactlyOnce);
    let _a = h.connect("A", true);
    let _b = h.connect("B", true);

    for (client, payload) in [("A", b"from-a"), ("B", b"from-b")] {
        assert_ok!(h
            .processor
            .process_publish(client, publish("t", QoS::ExactlyOnce, Some(3), payload)));
        assert_ok!(h.processor.process_pub_rel(client, 3));
    }

    let delivered = s.publishes();
    assert_eq!(delivered.len(), 2);
    let first = delivered[0].message_id.unwrap();
    let second = delivered[1].message_id.unwrap();
    assert_ne!(first, second);
    assert_eq!(h.store.in_flight_keys().len(), 2);

    assert_ok!(h.processor.process_pub_comp("S", first));
    assert_ok!(h.processor.process_pub_comp("S", second));
    assert!(h.store.in_flight_keys().is_empty());
}

#[test]
fn queued_copies_with_equal_publisher_ids_stay_separate() {
    let h = harness();
    let mut s = h.connect("S", false);
    h.subscribe(&mut s, "S", "t", QoS::AtLeastOnce);
    h.disconnect(&s, "S");

    let _a = h.connect("A", true);
    let _b = h.connect("B", true);
    assert_ok!(h
        .processor
        .process_publish("A", publish("t", QoS::AtLeastOnce, Some(1), b"1")));
    assert_ok!(h
        .processor
        .process_publish("B", publish("t", QoS::AtLeastOnce, Some(1), b"2")));

    let mut s = h.open(ConnectRequest::new(3, "S", false));
    let delivered = s.publishes();
    assert_eq!(delivered.len(), 2);
    assert_ne!(delivered[0].message_id, delivered[1].message_id);
    assert_eq!(h.store.in_flight_keys().len(), 2);

    assert_ok!(h
        .processor
        .process_pub_ack("S", delivered[0].message_id.unwrap()));
    assert_eq!(
        h.store.in_flight_keys(),
        vec![InFlightKey::new("S", delivered[1].message_id.unwrap())]
    );
}

#[test]
fn qos2_retained_replay_goes_out_at_qos1() {
    let h = harness();
    let _p = h.connect("P", true);
    let mut request = publish("r/1", QoS::ExactlyOnce, Some(4), b"state");
    request.retain = true;
    assert_ok!(h.processor.process_publish("P", request));
    assert_ok!(h.processor.process_pub_rel("P", 4));
    assert_eq!(h.store.retained("r/1").unwrap().qos, QoS::ExactlyOnce);

    let mut s = h.connect("S", true);
    assert_ok!(h.processor.process_subscribe(
        "S",
        SubscribeRequest {
            message_id: 2,
            topics: vec![SubscribeTopic {
                filter: "r/#".into(),
                qos: QoS::ExactlyOnce,
            }],
        },
    ));

    let replayed = s.publishes();
    assert_eq!(replayed.len(), 1);
    assert!(replayed[0].retain);
    assert_eq!(replayed[0].qos, QoS::AtLeastOnce);
    assert_ok!(h
        .processor
        .process_pub_ack("S", replayed[0].message_id.unwrap()));
    assert!(h.store.in_flight_keys().is_empty());
}

#[test]
fn qos1_publish_is_queued_for_offline_qos0_subscriber() {
    let h = harness();
    let mut s = h.connect("S", false);
    h.subscribe(&mut s, "S", "t", QoS::AtMostOnce);
    h.disconnect(&s, "S");

    let _p = h.connect("P", true);
    assert_ok!(h
        .processor
        .process_publish("P", publish("t", QoS::AtLeastOnce, Some(8), b"late")));

    let queued = h.store.queued_for("S");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].qos, QoS::AtMostOnce);

    let mut s = h.open(ConnectRequest::new(3, "S", false));
    let delivered = s.publishes();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].qos, QoS::AtMostOnce);
    assert_eq!(delivered[0].message_id, None);
    assert!(h.store.in_flight_keys().is_empty());
}

#[test]
fn failed_redelivery_puts_queue_back() {
    let store = Arc::new(FlakyStore::default());
    let processor = ProtocolProcessor::new(
        BrokerConfig::default(),
        store.clone(),
        Arc::new(MemorySubscriptionIndex::new()),
        Arc::new(AllowAll),
    );

    let (s, _srx) = ChannelConnection::new();
    assert_ok!(processor.process_connect(s.clone(), ConnectRequest::new(3, "S", false)));
    assert_ok!(processor.process_subscribe(
        "S",
        SubscribeRequest {
            message_id: 1,
            topics: vec![SubscribeTopic {
                filter: "t".into(),
                qos: QoS::AtLeastOnce,
            }],
        },
    ));
    assert_ok!(processor.process_disconnect(s.as_ref(), "S"));

    let (p, _prx) = ChannelConnection::new();
    assert_ok!(processor.process_connect(p, ConnectRequest::new(3, "P", true)));
    for (id, payload) in [(1, b"one"), (2, b"two")] {
        assert_ok!(processor.process_publish("P", publish("t", QoS::AtLeastOnce, Some(id), payload)));
    }
    assert_eq!(store.inner.queued_for("S").len(), 2);

    store.fail_in_flight.store(true, Ordering::SeqCst);
    let (s, _srx) = ChannelConnection::new();
    let err = assert_err!(processor.process_connect(s, ConnectRequest::new(3, "S", false)));
    assert!(matches!(err, ProcessorError::Store(_)));

    let restored = store.inner.queued_for("S");
    let payloads: Vec<&[u8]> = restored.iter().map(|r| r.payload.as_slice()).collect();
    assert_eq!(payloads, vec![b"one".as_slice(), b"two".as_slice()]);
    assert!(store.inner.in_flight_keys().is_empty());
}
