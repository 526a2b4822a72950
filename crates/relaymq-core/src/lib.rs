//! # RelayMQ Core
//!
//! Delivery model shared by every RelayMQ crate.
//!
//! This crate provides:
//! - MQTT quality-of-service levels and the per-subscriber downgrade rule
//! - Publish records persisted while a delivery handshake is outstanding
//! - In-flight keys identifying a handshake by (client, message identifier)
//! - Subscriptions and retained messages as stored by the broker

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod qos;
pub mod record;
pub mod subscription;

pub use qos::{QoS, QoSError};
pub use record::{DeliveryStage, InFlightKey, PublishRecord, RecordError, RetainedMessage};
pub use subscription::Subscription;
