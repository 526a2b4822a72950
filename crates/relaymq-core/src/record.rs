//! Publish records persisted by the durable store.

use crate::qos::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an outstanding delivery handshake.
///
/// The sender side of a publish and every QoS 2 forward to a subscriber
/// each get their own key, so both lifecycles can be tracked independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InFlightKey {
    /// Client on the other end of the handshake
    pub client_id: String,
    /// MQTT message identifier
    pub message_id: u16,
}

impl InFlightKey {
    /// Create a key for a client and message identifier.
    #[must_use]
    pub fn new(client_id: impl Into<String>, message_id: u16) -> Self {
        Self {
            client_id: client_id.into(),
            message_id,
        }
    }
}

impl fmt::Display for InFlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.client_id, self.message_id)
    }
}

/// A publish as it is stored while awaiting acknowledgment or delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    /// Concrete topic name
    pub topic: String,
    /// Delivery guarantee of this copy
    pub qos: QoS,
    /// Message body
    pub payload: Vec<u8>,
    /// Retain flag as published
    pub retain: bool,
    /// Owning client: the publisher for sender-side records, the
    /// subscriber for forwarded and queued copies
    pub client_id: String,
    /// Message identifier, present for QoS 1 and 2
    pub message_id: Option<u16>,
    /// Handshake progress while tracked in-flight
    #[serde(default)]
    pub stage: DeliveryStage,
}

/// Where a tracked publish is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryStage {
    /// Received from its publisher, not yet acknowledged back
    #[default]
    Inbound,
    /// Sent to a subscriber, awaiting PUBACK or PUBREC
    Sent,
    /// PUBREL sent to a subscriber, awaiting PUBCOMP
    Released,
}

impl DeliveryStage {
    /// Whether the record tracks a delivery to a subscriber.
    #[must_use]
    pub fn is_outbound(self) -> bool {
        self != Self::Inbound
    }
}

impl PublishRecord {
    /// Copy of this record to be sent to another client at another level.
    ///
    /// The copy has no message identifier yet; the broker assigns one per
    /// recipient.
    #[must_use]
    pub fn readdressed(&self, client_id: &str, qos: QoS) -> Self {
        Self {
            topic: self.topic.clone(),
            qos,
            payload: self.payload.clone(),
            retain: self.retain,
            client_id: client_id.to_string(),
            message_id: None,
            stage: DeliveryStage::Sent,
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, RecordError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| RecordError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, RecordError> {
        ciborium::from_reader(bytes).map_err(|e| RecordError::Deserialize(e.to_string()))
    }
}

/// Last message published with the retain flag on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedMessage {
    /// Topic the message was published to
    pub topic: String,
    /// Message body
    pub payload: Vec<u8>,
    /// Level it was published with
    pub qos: QoS,
}

/// Errors for record encoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecordError {
    /// Serialization failed
    #[error("serialize error: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialize error: {0}")]
    Deserialize(String),
}
