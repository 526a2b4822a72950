//! In-memory subscription index.

use crate::{StoreResult, SubscriptionIndex};
use parking_lot::RwLock;
use relaymq_core::Subscription;
use relaymq_proto::topics;
use std::collections::{BTreeMap, HashMap};

/// Subscriptions grouped per client, one entry per filter.
#[derive(Debug, Default)]
pub struct MemorySubscriptionIndex {
    by_client: RwLock<HashMap<String, BTreeMap<String, Subscription>>>,
}

impl MemorySubscriptionIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscriptions of one client, ordered by filter.
    #[must_use]
    pub fn for_client(&self, client_id: &str) -> Vec<Subscription> {
        self.by_client
            .read()
            .get(client_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_client.read().values().map(BTreeMap::len).sum()
    }

    /// Whether the index holds no subscription.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_active(&self, client_id: &str, active: bool) {
        if let Some(subs) = self.by_client.write().get_mut(client_id) {
            for sub in subs.values_mut() {
                sub.active = active;
            }
        }
    }
}

impl SubscriptionIndex for MemorySubscriptionIndex {
    fn add(&self, subscription: Subscription) -> StoreResult<()> {
        self.by_client
            .write()
            .entry(subscription.client_id.clone())
            .or_default()
            .insert(subscription.filter.clone(), subscription);
        Ok(())
    }

    fn remove(&self, filter: &str, client_id: &str) -> StoreResult<()> {
        let mut by_client = self.by_client.write();
        if let Some(subs) = by_client.get_mut(client_id) {
            subs.remove(filter);
            if subs.is_empty() {
                by_client.remove(client_id);
            }
        }
        Ok(())
    }

    fn remove_for_client(&self, client_id: &str) -> StoreResult<()> {
        self.by_client.write().remove(client_id);
        Ok(())
    }

    fn activate(&self, client_id: &str) -> StoreResult<()> {
        self.set_active(client_id, true);
        Ok(())
    }

    fn deactivate(&self, client_id: &str) -> StoreResult<()> {
        self.set_active(client_id, false);
        Ok(())
    }

    fn matches(&self, topic: &str) -> StoreResult<Vec<Subscription>> {
        Ok(self
            .by_client
            .read()
            .values()
            .flat_map(BTreeMap::values)
            .filter(|sub| topics::matches(&sub.filter, topic))
            .cloned()
            .collect())
    }
}
