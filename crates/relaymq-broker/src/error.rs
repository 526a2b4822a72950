//! Processor error taxonomy.

use crate::connection::ConnectionError;
use relaymq_core::{InFlightKey, QoS};
use relaymq_proto::TopicError;
use relaymq_store::{RecordKind, StoreError};

/// Errors returned by [`ProtocolProcessor`](crate::ProtocolProcessor).
///
/// Protocol rejections are not errors; they are answered with return codes.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// An acknowledgment arrived for a handshake with no in-flight record
    #[error("no in-flight record for {key}")]
    MissingInFlight {
        /// Handshake key
        key: InFlightKey,
    },
    /// A release arrived for a QoS 2 publish that was never stored
    #[error("no pending QoS 2 record for {key}")]
    MissingQos2 {
        /// Handshake key
        key: InFlightKey,
    },
    /// The client has no registered session
    #[error("no session registered for client {client_id}")]
    UnknownSession {
        /// Client identifier
        client_id: String,
    },
    /// A QoS 1 or 2 publish carried no message identifier
    #[error("{qos} publish from {client_id} has no message identifier")]
    MissingMessageId {
        /// Publisher
        client_id: String,
        /// Requested level
        qos: QoS,
    },
    /// Every message identifier is in flight to one client
    #[error("no free message identifier for client {client_id}")]
    MessageIdsExhausted {
        /// Recipient
        client_id: String,
    },
    /// A published topic name is malformed
    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
    /// The durable store or subscription index failed
    #[error("store error: {0}")]
    Store(StoreError),
    /// Closing a connection failed
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl ProcessorError {
    /// Whether this signals broken sequencing inside the broker rather than
    /// a bad request or a collaborator failure.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::MissingInFlight { .. } | Self::MissingQos2 { .. } | Self::UnknownSession { .. }
        )
    }
}

impl From<StoreError> for ProcessorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound {
                kind: RecordKind::InFlight,
                key,
            } => Self::MissingInFlight { key },
            StoreError::NotFound {
                kind: RecordKind::Qos2,
                key,
            } => Self::MissingQos2 { key },
            other => Self::Store(other),
        }
    }
}
