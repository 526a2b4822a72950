//! # RelayMQ Broker
//!
//! The stateful half of an MQTT broker: turns decoded protocol events from
//! many concurrent connections into ordered, delivery-guaranteed outbound
//! events.
//!
//! ## Architecture
//!
//! - [`SessionRegistry`]: client identifier to live connection handle
//! - [`ProtocolProcessor`]: connect / publish / subscribe / acknowledgment
//!   handling over the registry, a subscription index and a durable store
//! - [`Connection`]: what the transport layer hands the processor; framing,
//!   socket I/O and idle detection stay on the transport side
//!
//! Collaborators are shared behind `Arc` and are internally synchronized, so
//! one processor serves every connection handler concurrently.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod locks;
pub mod processor;
pub mod registry;
pub mod runtime;

pub use auth::{AllowAll, Authenticator, StaticAuthenticator};
pub use config::{BrokerConfig, PersistenceConfig, QosPolicy, StoreType, SubAckGrant};
pub use connection::{ChannelConnection, CloseMode, Connection, ConnectionError, ConnectionId};
pub use error::ProcessorError;
pub use processor::ProtocolProcessor;
pub use registry::{ClientSession, SessionRegistry};
pub use runtime::build_processor;
