//! MQTT quality-of-service levels.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery guarantee of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum QoS {
    /// Fire and forget
    AtMostOnce = 0,
    /// Acknowledged with PUBACK
    AtLeastOnce = 1,
    /// Four-step PUBREC / PUBREL / PUBCOMP handshake
    ExactlyOnce = 2,
}

impl QoS {
    /// Level used for the copy sent to a subscriber: the lower of the
    /// publisher's and the subscriber's levels.
    #[must_use]
    pub fn downgrade(self, subscribed: Self) -> Self {
        self.min(subscribed)
    }

    /// Whether the level requires a message identifier.
    #[must_use]
    pub fn needs_ack(self) -> bool {
        self != Self::AtMostOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = QoSError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(QoSError::OutOfRange(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Errors converting raw QoS values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QoSError {
    /// Value is not 0, 1 or 2
    #[error("invalid QoS level {0}")]
    OutOfRange(u8),
}
