//! Subscriptions held by the subscription index.

use crate::qos::QoS;
use serde::{Deserialize, Serialize};

/// A client's interest in a topic filter.
///
/// At most one subscription exists per (client, filter) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscribing client
    pub client_id: String,
    /// Topic filter, possibly with `+` / `#` wildcards
    pub filter: String,
    /// Requested level
    pub qos: QoS,
    /// Clean-session flag of the owning session
    pub clean_session: bool,
    /// Mirrors whether the owning client is connected
    pub active: bool,
}

impl Subscription {
    /// Create an active subscription.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        filter: impl Into<String>,
        qos: QoS,
        clean_session: bool,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            filter: filter.into(),
            qos,
            clean_session,
            active: true,
        }
    }

    /// Whether a QoS 1/2 publish must be queued instead of delivered.
    #[must_use]
    pub fn is_offline_durable(&self) -> bool {
        !self.clean_session && !self.active
    }
}
