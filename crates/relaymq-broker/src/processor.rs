//! The protocol processor.
//!
//! Each operation handles one decoded inbound event on behalf of a client
//! and writes its replies through the [`SessionRegistry`]. The processor is
//! shared by every connection handler; all mutable state lives in the
//! registry, the subscription index and the durable store.

use crate::auth::Authenticator;
use crate::config::{BrokerConfig, QosPolicy, SubAckGrant};
use crate::connection::Connection;
use crate::error::ProcessorError;
use crate::locks::KeyLocks;
use crate::registry::{ClientSession, SessionRegistry};
use relaymq_core::{DeliveryStage, InFlightKey, PublishRecord, QoS, Subscription};
use relaymq_proto::{
    topics, ConnectRequest, ConnectReturnCode, LastWill, Outbound, PublishPacket, PublishRequest,
    SubscribeRequest, SubscribeReturnCode, UnsubscribeRequest,
};
use relaymq_store::{DurableStore, SubscriptionIndex};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

type Result<T> = std::result::Result<T, ProcessorError>;

/// Connection lifecycle, delivery handshakes, fan-out and retained replay.
pub struct ProtocolProcessor {
    config: BrokerConfig,
    sessions: SessionRegistry,
    subscriptions: Arc<dyn SubscriptionIndex>,
    store: Arc<dyn DurableStore>,
    authenticator: Arc<dyn Authenticator>,
    locks: KeyLocks,
    next_message_id: AtomicU16,
}

impl ProtocolProcessor {
    /// Create a processor over its collaborators.
    #[must_use]
    pub fn new(
        config: BrokerConfig,
        store: Arc<dyn DurableStore>,
        subscriptions: Arc<dyn SubscriptionIndex>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config,
            sessions: SessionRegistry::new(),
            subscriptions,
            store,
            authenticator,
            locks: KeyLocks::default(),
            next_message_id: AtomicU16::new(1),
        }
    }

    /// Active sessions.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Admit a client.
    ///
    /// Rejections are answered with a CONNACK return code and are not
    /// errors. Effects applied before a rejection (eviction, registration,
    /// the will publish) stay applied.
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator fails or closing the evicted
    /// connection is interrupted.
    pub fn process_connect(
        &self,
        connection: Arc<dyn Connection>,
        request: ConnectRequest,
    ) -> Result<()> {
        if request.protocol_version != self.config.protocol_version {
            tracing::warn!(
                connection_id = %connection.id(),
                version = request.protocol_version,
                "Rejecting connect: unsupported protocol version"
            );
            reply(
                connection.as_ref(),
                Outbound::ConnAck(ConnectReturnCode::UnacceptableProtocolVersion),
            );
            connection.close(true)?;
            return Ok(());
        }

        let Some(client_id) = request
            .client_id
            .filter(|id| !id.is_empty() && id.chars().count() <= self.config.max_client_id_len)
        else {
            tracing::warn!(connection_id = %connection.id(), "Rejecting connect: bad client identifier");
            reply(
                connection.as_ref(),
                Outbound::ConnAck(ConnectReturnCode::IdentifierRejected),
            );
            return Ok(());
        };

        if let Some(previous) = self.sessions.get(&client_id) {
            if previous.clean_session {
                self.purge_client(&client_id)?;
            }
            tracing::info!(
                client_id = %client_id,
                evicted = %previous.connection_id(),
                "Client reconnected, closing previous connection"
            );
            previous.connection.close(true)?;
        }

        self.sessions.register(ClientSession::new(
            client_id.clone(),
            request.clean_session,
            request.keep_alive,
            Arc::clone(&connection),
        ));
        connection.set_idle_timeout(self.config.idle_timeout(request.keep_alive));

        if let Some(will) = request.will {
            self.publish_will(&client_id, will)?;
        }

        if let Some(credentials) = &request.credentials {
            if !self
                .authenticator
                .check_valid(&credentials.username, credentials.password.as_deref())
            {
                tracing::warn!(client_id = %client_id, username = %credentials.username, "Rejecting connect: bad credentials");
                reply(
                    connection.as_ref(),
                    Outbound::ConnAck(ConnectReturnCode::BadUsernameOrPassword),
                );
                return Ok(());
            }
        }

        self.subscriptions.activate(&client_id)?;

        if request.clean_session {
            self.purge_client(&client_id)?;
        } else {
            self.republish_stored(&client_id)?;
        }

        tracing::info!(
            client_id = %client_id,
            clean_session = request.clean_session,
            keep_alive = request.keep_alive,
            "Client connected"
        );
        reply(
            connection.as_ref(),
            Outbound::ConnAck(ConnectReturnCode::Accepted),
        );
        Ok(())
    }

    /// Tear down a client's session.
    ///
    /// Only acts on the session if `connection` is still the one bound to
    /// `client_id`; a connection that was already evicted is just closed.
    /// Persistent sessions keep their subscriptions, deactivated; clean
    /// sessions lose them.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Connection`] if closing is interrupted, in
    /// which case the subscriptions are left as they were.
    pub fn process_disconnect(&self, connection: &dyn Connection, client_id: &str) -> Result<()> {
        let Some(session) = self.sessions.remove_if_bound(client_id, connection.id()) else {
            tracing::debug!(client_id = %client_id, connection_id = %connection.id(), "Disconnect from stale connection");
            connection.close(true)?;
            return Ok(());
        };

        connection.close(true)?;

        if session.clean_session {
            self.purge_client(client_id)?;
        } else {
            self.subscriptions.deactivate(client_id)?;
        }
        tracing::info!(client_id = %client_id, clean_session = session.clean_session, "Client disconnected");
        Ok(())
    }

    /// Accept a PUBLISH from `client_id`.
    ///
    /// QoS 0 and 1 are fanned out immediately. QoS 2 is held until the
    /// sender releases it with PUBREL.
    ///
    /// # Errors
    ///
    /// Returns error if the topic is malformed, a QoS 1/2 publish has no
    /// message identifier, or a collaborator fails.
    pub fn process_publish(&self, client_id: &str, request: PublishRequest) -> Result<()> {
        topics::validate_topic(&request.topic)?;
        let record = request.into_record(client_id);
        tracing::debug!(
            client_id = %client_id,
            topic = %record.topic,
            qos = %record.qos,
            message_id = ?record.message_id,
            "Publish received"
        );

        match record.qos {
            QoS::AtMostOnce => self.fan_out(&record)?,
            QoS::AtLeastOnce => {
                let message_id = require_message_id(&record)?;
                let key = InFlightKey::new(client_id, message_id);
                let _guard = self.locks.lock(&key);

                self.store.add_in_flight(&key, &record)?;
                self.fan_out(&record)?;
                self.store.clean_in_flight(&key).map_err(internal)?;
                self.deliver(client_id, Outbound::PubAck(message_id));
            }
            QoS::ExactlyOnce => {
                let message_id = require_message_id(&record)?;
                let key = InFlightKey::new(client_id, message_id);
                let _guard = self.locks.lock(&key);

                self.store.persist_qos2(&key, &record)?;
                self.deliver(client_id, Outbound::PubRec(message_id));
                return Ok(());
            }
        }

        if record.retain {
            self.store
                .store_retained(&record.topic, &record.payload, record.qos)?;
        }
        Ok(())
    }

    /// PUBACK from a subscriber.
    ///
    /// Live QoS 1 forwards are not tracked, so a missing record is normal.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub fn process_pub_ack(&self, client_id: &str, message_id: u16) -> Result<()> {
        let key = InFlightKey::new(client_id, message_id);
        let _guard = self.locks.lock(&key);

        match self.store.clean_in_flight(&key) {
            Ok(_) => tracing::debug!(key = %key, "Redelivery acknowledged"),
            Err(err) if err.is_not_found() => tracing::debug!(key = %key, "PUBACK for untracked message"),
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// PUBREL from a QoS 2 sender: fan out the held publish, then complete.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::MissingQos2`] if nothing is held under
    /// (client, message id), or error if a collaborator fails.
    pub fn process_pub_rel(&self, client_id: &str, message_id: u16) -> Result<()> {
        let key = InFlightKey::new(client_id, message_id);
        let _guard = self.locks.lock(&key);

        let record = self.store.retrieve_qos2(&key).map_err(internal)?;
        self.fan_out(&record)?;
        self.store.remove_qos2(&key)?;

        if record.retain {
            self.store
                .store_retained(&record.topic, &record.payload, record.qos)?;
        }
        self.deliver(client_id, Outbound::PubComp(message_id));
        Ok(())
    }

    /// PUBREC from a QoS 2 subscriber: ask it to release.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub fn process_pub_rec(&self, client_id: &str, message_id: u16) -> Result<()> {
        let key = InFlightKey::new(client_id, message_id);
        let _guard = self.locks.lock(&key);

        match self.store.in_flight(&key)? {
            Some(mut record) if record.stage.is_outbound() => {
                record.stage = DeliveryStage::Released;
                self.store.add_in_flight(&key, &record)?;
            }
            _ => tracing::warn!(key = %key, "PUBREC for untracked message"),
        }
        self.deliver(client_id, Outbound::PubRel(message_id));
        Ok(())
    }

    /// PUBCOMP from a QoS 2 subscriber: the forward is complete.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::MissingInFlight`] if the forward was not
    /// tracked, or error if the store fails.
    pub fn process_pub_comp(&self, client_id: &str, message_id: u16) -> Result<()> {
        let key = InFlightKey::new(client_id, message_id);
        let _guard = self.locks.lock(&key);

        self.store.clean_in_flight(&key).map_err(internal)?;
        tracing::debug!(key = %key, "QoS 2 forward complete");
        Ok(())
    }

    /// Register subscriptions, replay retained messages, then SUBACK.
    ///
    /// Malformed filters are skipped and reported with a failure code.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::UnknownSession`] if `client_id` is not
    /// connected, or error if a collaborator fails.
    pub fn process_subscribe(&self, client_id: &str, request: SubscribeRequest) -> Result<()> {
        let session = self.sessions.get(client_id).ok_or_else(|| {
            internal(ProcessorError::UnknownSession {
                client_id: client_id.to_string(),
            })
        })?;

        let mut return_codes = Vec::with_capacity(request.topics.len());
        for topic in request.topics {
            if let Err(err) = topics::validate_filter(&topic.filter) {
                tracing::warn!(client_id = %client_id, filter = %topic.filter, error = %err, "Rejecting subscription");
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            self.subscriptions.add(Subscription::new(
                client_id,
                topic.filter.as_str(),
                topic.qos,
                session.clean_session,
            ))?;
            tracing::debug!(client_id = %client_id, filter = %topic.filter, qos = %topic.qos, "Subscribed");

            self.replay_retained(client_id, &topic.filter, topic.qos)?;

            return_codes.push(SubscribeReturnCode::Granted(match self.config.suback_grant {
                SubAckGrant::AtMostOnce => QoS::AtMostOnce,
                SubAckGrant::Requested => topic.qos,
            }));
        }

        self.deliver(
            client_id,
            Outbound::SubAck {
                message_id: request.message_id,
                return_codes,
            },
        );
        Ok(())
    }

    /// Drop subscriptions, then UNSUBACK. Unknown filters are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription index fails.
    pub fn process_unsubscribe(&self, client_id: &str, request: UnsubscribeRequest) -> Result<()> {
        for filter in request.filters {
            self.subscriptions.remove(&filter, client_id)?;
            tracing::debug!(client_id = %client_id, filter = %filter, "Unsubscribed");
        }
        self.deliver(client_id, Outbound::UnsubAck(request.message_id));
        Ok(())
    }

    /// Send `record` to every matching subscriber.
    ///
    /// Whether a copy is queued for an offline subscriber depends on the
    /// published level; the level of the copy itself follows the policy.
    /// Every QoS 1/2 copy gets its own broker id.
    fn fan_out(&self, record: &PublishRecord) -> Result<()> {
        let subscribers = self.subscriptions.matches(&record.topic)?;
        tracing::debug!(topic = %record.topic, subscribers = subscribers.len(), "Fan-out");

        for subscription in subscribers {
            let qos = self.outgoing_qos(record.qos, subscription.qos);
            let mut copy = record.readdressed(&subscription.client_id, qos);

            if record.qos.needs_ack() && subscription.is_offline_durable() {
                tracing::debug!(client_id = %subscription.client_id, topic = %copy.topic, "Queueing for offline subscriber");
                self.store.store_for_future(&copy)?;
                continue;
            }

            if qos == QoS::AtMostOnce {
                self.notify(&copy, false);
                continue;
            }

            let message_id = self.allocate_message_id_for(&subscription.client_id)?;
            copy.message_id = Some(message_id);
            if qos == QoS::ExactlyOnce {
                self.store
                    .add_in_flight(&InFlightKey::new(&subscription.client_id, message_id), &copy)?;
            }
            self.notify(&copy, false);
        }
        Ok(())
    }

    /// Fan out a will immediately; no handshake runs with its owner.
    fn publish_will(&self, client_id: &str, will: LastWill) -> Result<()> {
        if let Err(err) = topics::validate_topic(&will.topic) {
            tracing::warn!(client_id = %client_id, topic = %will.topic, error = %err, "Ignoring will with invalid topic");
            return Ok(());
        }

        let record = PublishRecord {
            topic: will.topic,
            qos: will.qos,
            payload: will.payload,
            retain: will.retain,
            client_id: client_id.to_string(),
            message_id: None,
            stage: DeliveryStage::Inbound,
        };
        self.fan_out(&record)?;
        if record.retain {
            self.store
                .store_retained(&record.topic, &record.payload, record.qos)?;
        }
        Ok(())
    }

    /// Redeliver what a persistent client left unacknowledged, then the
    /// publishes queued while it was away.
    fn republish_stored(&self, client_id: &str) -> Result<()> {
        self.resend_in_flight(client_id)?;
        self.drain_queued(client_id)
    }

    /// Resend outbound in-flight copies with DUP set, or PUBREL for copies
    /// the client already acknowledged with PUBREC.
    fn resend_in_flight(&self, client_id: &str) -> Result<()> {
        for (key, _) in self.store.in_flight_for_client(client_id)? {
            let _guard = self.locks.lock(&key);
            let Some(record) = self.store.in_flight(&key)? else {
                continue;
            };

            match record.stage {
                DeliveryStage::Inbound => {}
                DeliveryStage::Sent => {
                    tracing::debug!(key = %key, "Resending unacknowledged publish");
                    self.notify(&record, true);
                }
                DeliveryStage::Released => {
                    tracing::debug!(key = %key, "Resending PUBREL");
                    self.deliver(client_id, Outbound::PubRel(key.message_id));
                }
            }
        }
        Ok(())
    }

    /// Deliver publishes queued while a persistent client was away.
    ///
    /// If tracking a copy fails, it and every later one go back on the queue.
    fn drain_queued(&self, client_id: &str) -> Result<()> {
        let queued = self.store.take_queued(client_id)?;
        if !queued.is_empty() {
            tracing::info!(client_id = %client_id, count = queued.len(), "Republishing stored messages");
        }

        let mut queued = queued.into_iter();
        while let Some(record) = queued.next() {
            if let Err(err) = self.send_queued(client_id, record.clone()) {
                self.requeue(std::iter::once(record).chain(queued));
                return Err(err);
            }
        }
        Ok(())
    }

    fn send_queued(&self, client_id: &str, mut record: PublishRecord) -> Result<()> {
        if record.qos.needs_ack() {
            let message_id = self.allocate_message_id_for(client_id)?;
            record.message_id = Some(message_id);
            record.stage = DeliveryStage::Sent;
            self.store
                .add_in_flight(&InFlightKey::new(client_id, message_id), &record)?;
        } else {
            record.message_id = None;
        }
        self.notify(&record, false);
        Ok(())
    }

    fn requeue(&self, records: impl Iterator<Item = PublishRecord>) {
        for record in records {
            if let Err(err) = self.store.store_for_future(&record) {
                tracing::error!(
                    client_id = %record.client_id,
                    topic = %record.topic,
                    error = %err,
                    "Failed to restore queued publish"
                );
            }
        }
    }

    /// Send matching retained messages to a new subscriber.
    ///
    /// Replays are not tracked, so they go out at QoS 1 at most.
    fn replay_retained(&self, client_id: &str, filter: &str, requested: QoS) -> Result<()> {
        let retained = self
            .store
            .search_retained(&|topic: &str| topics::matches(filter, topic))?;

        for message in retained {
            let qos = self
                .outgoing_qos(message.qos, requested)
                .min(QoS::AtLeastOnce);
            let message_id = if qos.needs_ack() {
                Some(self.allocate_message_id_for(client_id)?)
            } else {
                None
            };
            tracing::debug!(client_id = %client_id, topic = %message.topic, "Replaying retained message");
            self.deliver(
                client_id,
                Outbound::Publish(PublishPacket {
                    topic: message.topic,
                    qos,
                    payload: message.payload,
                    retain: true,
                    dup: false,
                    message_id,
                }),
            );
        }
        Ok(())
    }

    fn purge_client(&self, client_id: &str) -> Result<()> {
        self.subscriptions.remove_for_client(client_id)?;
        self.store.clean_persisted_for_client(client_id)?;
        Ok(())
    }

    fn outgoing_qos(&self, published: QoS, subscribed: QoS) -> QoS {
        match self.config.qos_policy {
            QosPolicy::Minimum => published.downgrade(subscribed),
            QosPolicy::Publisher => published,
        }
    }

    /// Next broker id with no in-flight record for `client_id`.
    fn allocate_message_id_for(&self, client_id: &str) -> Result<u16> {
        for _ in 0..u16::MAX {
            let message_id = self.allocate_message_id();
            if self
                .store
                .in_flight(&InFlightKey::new(client_id, message_id))?
                .is_none()
            {
                return Ok(message_id);
            }
        }
        Err(ProcessorError::MessageIdsExhausted {
            client_id: client_id.to_string(),
        })
    }

    fn allocate_message_id(&self) -> u16 {
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn notify(&self, record: &PublishRecord, dup: bool) {
        self.deliver(
            &record.client_id,
            Outbound::Publish(PublishPacket {
                topic: record.topic.clone(),
                qos: record.qos,
                payload: record.payload.clone(),
                retain: false,
                dup,
                message_id: record.message_id,
            }),
        );
    }

    /// Write to a client's live connection; failures are logged and dropped.
    fn deliver(&self, client_id: &str, message: Outbound) {
        if self.sessions.is_empty() {
            tracing::warn!(client_id = %client_id, kind = message.kind(), "No sessions registered, dropping delivery");
            return;
        }
        let Some(connection) = self.sessions.connection(client_id) else {
            tracing::warn!(client_id = %client_id, kind = message.kind(), "Client not connected, dropping delivery");
            return;
        };
        let kind = message.kind();
        if let Err(err) = connection.write(message) {
            tracing::warn!(client_id = %client_id, kind, error = %err, "Delivery failed, dropping");
        }
    }
}

/// Write to a connection that may not be registered; failures are logged.
fn reply(connection: &dyn Connection, message: Outbound) {
    let kind = message.kind();
    if let Err(err) = connection.write(message) {
        tracing::warn!(connection_id = %connection.id(), kind, error = %err, "Reply failed");
    }
}

fn require_message_id(record: &PublishRecord) -> Result<u16> {
    record
        .message_id
        .ok_or_else(|| ProcessorError::MissingMessageId {
            client_id: record.client_id.clone(),
            qos: record.qos,
        })
}

/// Convert, logging consistency violations loudly.
fn internal(err: impl Into<ProcessorError>) -> ProcessorError {
    let err = err.into();
    if err.is_internal() {
        tracing::error!(error = %err, "Internal consistency violation");
    }
    err
}
