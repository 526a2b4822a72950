//! Protocol events consumed and produced by the processor.
//!
//! Byte-level framing lives in the connection layer; these types are what it
//! decodes into and encodes from.

use relaymq_core::{DeliveryStage, PublishRecord, QoS};
use serde::{Deserialize, Serialize};

/// Decoded CONNECT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Protocol level declared by the client
    pub protocol_version: u8,
    /// Client identifier, if one was sent
    pub client_id: Option<String>,
    /// Discard session state on disconnect
    pub clean_session: bool,
    /// Keep-alive interval in seconds
    pub keep_alive: u16,
    /// Last will, if the will flag was set
    pub will: Option<LastWill>,
    /// Credentials, if the user-name flag was set
    pub credentials: Option<Credentials>,
}

impl ConnectRequest {
    /// Minimal request for a client identifier.
    #[must_use]
    pub fn new(protocol_version: u8, client_id: impl Into<String>, clean_session: bool) -> Self {
        Self {
            protocol_version,
            client_id: Some(client_id.into()),
            clean_session,
            keep_alive: 60,
            will: None,
            credentials: None,
        }
    }
}

/// Will message declared on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    /// Will topic
    pub topic: String,
    /// Will payload
    pub payload: Vec<u8>,
    /// Will QoS
    pub qos: QoS,
    /// Will retain flag
    pub retain: bool,
}

/// User name and optional password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password, if the password flag was set
    pub password: Option<String>,
}

/// Decoded PUBLISH from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Topic name
    pub topic: String,
    /// Requested delivery guarantee
    pub qos: QoS,
    /// Message body
    pub payload: Vec<u8>,
    /// Retain flag
    pub retain: bool,
    /// Message identifier, required for QoS 1 and 2
    pub message_id: Option<u16>,
}

impl PublishRequest {
    /// Build the record persisted for this publish on behalf of `sender`.
    #[must_use]
    pub fn into_record(self, sender: &str) -> PublishRecord {
        PublishRecord {
            topic: self.topic,
            qos: self.qos,
            payload: self.payload,
            retain: self.retain,
            client_id: sender.to_string(),
            message_id: self.message_id,
            stage: DeliveryStage::Inbound,
        }
    }
}

/// One filter of a SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeTopic {
    /// Topic filter
    pub filter: String,
    /// Requested level
    pub qos: QoS,
}

/// Decoded SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Message identifier echoed in SUBACK
    pub message_id: u16,
    /// Requested filters, in order
    pub topics: Vec<SubscribeTopic>,
}

/// Decoded UNSUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    /// Message identifier echoed in UNSUBACK
    pub message_id: u16,
    /// Filters to remove
    pub filters: Vec<String>,
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectReturnCode {
    /// 0x00
    Accepted,
    /// 0x01
    UnacceptableProtocolVersion,
    /// 0x02
    IdentifierRejected,
    /// 0x03
    ServerUnavailable,
    /// 0x04
    BadUsernameOrPassword,
    /// 0x05
    NotAuthorized,
}

impl ConnectReturnCode {
    /// Wire value.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Accepted => 0x00,
            Self::UnacceptableProtocolVersion => 0x01,
            Self::IdentifierRejected => 0x02,
            Self::ServerUnavailable => 0x03,
            Self::BadUsernameOrPassword => 0x04,
            Self::NotAuthorized => 0x05,
        }
    }
}

/// Per-filter SUBACK entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeReturnCode {
    /// Subscription registered at the given level
    Granted(QoS),
    /// Filter rejected (0x80)
    Failure,
}

impl SubscribeReturnCode {
    /// Wire value.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Granted(qos) => qos.into(),
            Self::Failure => 0x80,
        }
    }
}

/// PUBLISH sent to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishPacket {
    /// Topic name
    pub topic: String,
    /// Delivery guarantee of this copy
    pub qos: QoS,
    /// Message body
    pub payload: Vec<u8>,
    /// Set for retained replays
    pub retain: bool,
    /// Set when redelivering
    pub dup: bool,
    /// Only present for QoS 1 and 2
    pub message_id: Option<u16>,
}

/// Messages written to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outbound {
    /// Connect outcome
    ConnAck(ConnectReturnCode),
    /// Message delivery
    Publish(PublishPacket),
    /// QoS 1 acknowledgment
    PubAck(u16),
    /// QoS 2 receipt
    PubRec(u16),
    /// QoS 2 release
    PubRel(u16),
    /// QoS 2 completion
    PubComp(u16),
    /// Subscribe acknowledgment
    SubAck {
        /// Echoed identifier
        message_id: u16,
        /// One entry per requested filter
        return_codes: Vec<SubscribeReturnCode>,
    },
    /// Unsubscribe acknowledgment
    UnsubAck(u16),
}

impl Outbound {
    /// Control packet name, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnAck(_) => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::PubAck(_) => "PUBACK",
            Self::PubRec(_) => "PUBREC",
            Self::PubRel(_) => "PUBREL",
            Self::PubComp(_) => "PUBCOMP",
            Self::SubAck { .. } => "SUBACK",
            Self::UnsubAck(_) => "UNSUBACK",
        }
    }
}
