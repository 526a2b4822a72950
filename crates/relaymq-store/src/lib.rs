//! # RelayMQ Store
//!
//! Contracts the protocol processor needs from its persistence and
//! routing collaborators, with the implementations shipped by the broker.
//!
//! - [`DurableStore`]: in-flight QoS 1/2 state, retained messages and
//!   queued publishes for offline durable subscribers
//! - [`SubscriptionIndex`]: (filter, client) subscriptions and topic lookup
//!
//! Every implementation is internally synchronized; callers share them
//! behind `Arc` and never hold a lock across calls.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod index;
pub mod memory;
pub mod sqlite;

pub use index::MemorySubscriptionIndex;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use relaymq_core::{InFlightKey, PublishRecord, QoS, RecordError, RetainedMessage, Subscription};
use std::fmt;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// An in-flight record with its key.
pub type KeyedRecord = (InFlightKey, PublishRecord);

/// Persistence of delivery-guarantee state.
///
/// Keys are unique; adding under an existing key replaces the record.
pub trait DurableStore: Send + Sync {
    /// Track a QoS 1 publish, or a QoS 2 forward to a subscriber.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn add_in_flight(&self, key: &InFlightKey, record: &PublishRecord) -> StoreResult<()>;

    /// Remove and return an in-flight record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no record exists for `key`.
    fn clean_in_flight(&self, key: &InFlightKey) -> StoreResult<PublishRecord>;

    /// Look up an in-flight record without removing it.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn in_flight(&self, key: &InFlightKey) -> StoreResult<Option<PublishRecord>>;

    /// Every in-flight record held under `client_id`, ordered by message id.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn in_flight_for_client(&self, client_id: &str) -> StoreResult<Vec<KeyedRecord>>;

    /// Hold a QoS 2 publish until its sender releases it.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn persist_qos2(&self, key: &InFlightKey, record: &PublishRecord) -> StoreResult<()>;

    /// Fetch a held QoS 2 publish.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no record exists for `key`.
    fn retrieve_qos2(&self, key: &InFlightKey) -> StoreResult<PublishRecord>;

    /// Drop a held QoS 2 publish. Missing keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn remove_qos2(&self, key: &InFlightKey) -> StoreResult<()>;

    /// Replace the retained message of a topic. An empty payload clears it.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn store_retained(&self, topic: &str, payload: &[u8], qos: QoS) -> StoreResult<()>;

    /// Queue a publish for an offline durable subscriber (`record.client_id`).
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn store_for_future(&self, record: &PublishRecord) -> StoreResult<()>;

    /// Remove and return every queued publish for a client, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn take_queued(&self, client_id: &str) -> StoreResult<Vec<PublishRecord>>;

    /// Retained messages whose topic satisfies `condition`.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn search_retained(&self, condition: &dyn Fn(&str) -> bool)
        -> StoreResult<Vec<RetainedMessage>>;

    /// Drop all in-flight, pending QoS 2 and queued state of a client.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn clean_persisted_for_client(&self, client_id: &str) -> StoreResult<()>;
}

/// Subscriptions keyed by (filter, client).
pub trait SubscriptionIndex: Send + Sync {
    /// Insert or replace the subscription for its (filter, client) pair.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn add(&self, subscription: Subscription) -> StoreResult<()>;

    /// Remove one subscription. Unknown pairs are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn remove(&self, filter: &str, client_id: &str) -> StoreResult<()>;

    /// Remove every subscription of a client.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn remove_for_client(&self, client_id: &str) -> StoreResult<()>;

    /// Mark a client's subscriptions active.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn activate(&self, client_id: &str) -> StoreResult<()>;

    /// Mark a client's subscriptions inactive, keeping them.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn deactivate(&self, client_id: &str) -> StoreResult<()>;

    /// Subscriptions whose filter matches a concrete topic.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn matches(&self, topic: &str) -> StoreResult<Vec<Subscription>>;
}

/// Which keyed table a lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// In-flight QoS 1 / QoS 2 forward
    InFlight,
    /// QoS 2 publish awaiting release
    Qos2,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InFlight => f.write_str("in-flight"),
            Self::Qos2 => f.write_str("pending QoS 2"),
        }
    }
}

/// Errors for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Keyed lookup found nothing
    #[error("{kind} record not found: {key}")]
    NotFound {
        /// Table that was searched
        kind: RecordKind,
        /// Missing key
        key: InFlightKey,
    },
    /// SQLite failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Record could not be encoded or decoded
    #[error("record codec error: {0}")]
    Codec(#[from] RecordError),
    /// Stored column holds an impossible value
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether this is a keyed lookup miss.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
