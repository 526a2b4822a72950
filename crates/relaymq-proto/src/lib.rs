//! # RelayMQ Protocol
//!
//! Typed protocol events exchanged between the connection layer and the
//! protocol processor, plus MQTT topic semantics.
//!
//! ## Messages
//!
//! - Inbound: `ConnectRequest`, `PublishRequest`, `SubscribeRequest`, `UnsubscribeRequest`
//! - Outbound: `Outbound` (CONNACK, PUBLISH, PUBACK, PUBREC, PUBREL, PUBCOMP, SUBACK, UNSUBACK)
//!
//! ## Topics
//!
//! Filters use `+` for a single level and a trailing `#` for any number of levels.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{
    ConnectRequest, ConnectReturnCode, Credentials, LastWill, Outbound, PublishPacket,
    PublishRequest, SubscribeRequest, SubscribeReturnCode, SubscribeTopic, UnsubscribeRequest,
};
pub use topics::{matches, validate_filter, validate_topic, TopicError};
