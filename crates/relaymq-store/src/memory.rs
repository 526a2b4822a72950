//! In-memory durable store.
//!
//! State is lost on restart; used for `store_type = "memory"` and in tests.

use crate::{DurableStore, KeyedRecord, RecordKind, StoreError, StoreResult};
use parking_lot::RwLock;
use relaymq_core::{InFlightKey, PublishRecord, QoS, RetainedMessage};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Durable store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    in_flight: RwLock<HashMap<InFlightKey, PublishRecord>>,
    qos2: RwLock<HashMap<InFlightKey, PublishRecord>>,
    /// BTreeMap for deterministic replay order
    retained: RwLock<BTreeMap<String, RetainedMessage>>,
    queued: RwLock<HashMap<String, VecDeque<PublishRecord>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of all in-flight records, sorted.
    #[must_use]
    pub fn in_flight_keys(&self) -> Vec<InFlightKey> {
        let mut keys: Vec<InFlightKey> = self.in_flight.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys of all QoS 2 publishes awaiting release, sorted.
    #[must_use]
    pub fn qos2_keys(&self) -> Vec<InFlightKey> {
        let mut keys: Vec<InFlightKey> = self.qos2.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Queued publishes for a client, without draining them.
    #[must_use]
    pub fn queued_for(&self, client_id: &str) -> Vec<PublishRecord> {
        self.queued
            .read()
            .get(client_id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained message of a topic.
    #[must_use]
    pub fn retained(&self, topic: &str) -> Option<RetainedMessage> {
        self.retained.read().get(topic).cloned()
    }
}

impl DurableStore for MemoryStore {
    fn add_in_flight(&self, key: &InFlightKey, record: &PublishRecord) -> StoreResult<()> {
        self.in_flight.write().insert(key.clone(), record.clone());
        Ok(())
    }

    fn clean_in_flight(&self, key: &InFlightKey) -> StoreResult<PublishRecord> {
        self.in_flight
            .write()
            .remove(key)
            .ok_or_else(|| StoreError::NotFound {
                kind: RecordKind::InFlight,
                key: key.clone(),
            })
    }

    fn in_flight(&self, key: &InFlightKey) -> StoreResult<Option<PublishRecord>> {
        Ok(self.in_flight.read().get(key).cloned())
    }

    fn in_flight_for_client(&self, client_id: &str) -> StoreResult<Vec<KeyedRecord>> {
        let mut records: Vec<KeyedRecord> = self
            .in_flight
            .read()
            .iter()
            .filter(|(key, _)| key.client_id == client_id)
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    fn persist_qos2(&self, key: &InFlightKey, record: &PublishRecord) -> StoreResult<()> {
        self.qos2.write().insert(key.clone(), record.clone());
        Ok(())
    }

    fn retrieve_qos2(&self, key: &InFlightKey) -> StoreResult<PublishRecord> {
        self.qos2
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: RecordKind::Qos2,
                key: key.clone(),
            })
    }

    fn remove_qos2(&self, key: &InFlightKey) -> StoreResult<()> {
        self.qos2.write().remove(key);
        Ok(())
    }

    fn store_retained(&self, topic: &str, payload: &[u8], qos: QoS) -> StoreResult<()> {
        let mut retained = self.retained.write();
        if payload.is_empty() {
            retained.remove(topic);
        } else {
            retained.insert(
                topic.to_string(),
                RetainedMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    qos,
                },
            );
        }
        Ok(())
    }

    fn store_for_future(&self, record: &PublishRecord) -> StoreResult<()> {
        self.queued
            .write()
            .entry(record.client_id.clone())
            .or_default()
            .push_back(record.clone());
        Ok(())
    }

    fn take_queued(&self, client_id: &str) -> StoreResult<Vec<PublishRecord>> {
        Ok(self
            .queued
            .write()
            .remove(client_id)
            .map(Vec::from)
            .unwrap_or_default())
    }

    fn search_retained(
        &self,
        condition: &dyn Fn(&str) -> bool,
    ) -> StoreResult<Vec<RetainedMessage>> {
        Ok(self
            .retained
            .read()
            .values()
            .filter(|message| condition(&message.topic))
            .cloned()
            .collect())
    }

    fn clean_persisted_for_client(&self, client_id: &str) -> StoreResult<()> {
        self.in_flight
            .write()
            .retain(|key, _| key.client_id != client_id);
        self.qos2.write().retain(|key, _| key.client_id != client_id);
        self.queued.write().remove(client_id);
        Ok(())
    }
}
