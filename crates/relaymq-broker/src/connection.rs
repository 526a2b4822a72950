//! Connection handles supplied by the transport layer.

use parking_lot::Mutex;
use relaymq_proto::Outbound;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identity of one transport connection.
///
/// A client identifier can be bound to successive connections; the id tells
/// them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live connection as seen by the processor.
///
/// Writes are buffered by the transport and never block.
pub trait Connection: Send + Sync {
    /// Identity of this connection.
    fn id(&self) -> ConnectionId;

    /// Queue a message for the peer.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] once the connection is closed.
    fn write(&self, message: Outbound) -> Result<(), ConnectionError>;

    /// Close the connection, flushing queued writes when `graceful`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Interrupted`] if closing was interrupted.
    fn close(&self, graceful: bool) -> Result<(), ConnectionError>;

    /// Reader idle time after which the transport drops the connection.
    fn set_idle_timeout(&self, timeout: Duration);
}

/// Errors raised by connection handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Connection no longer accepts writes
    #[error("connection closed")]
    Closed,
    /// Close did not complete
    #[error("interrupted while closing connection")]
    Interrupted,
}

/// How a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Queued writes were flushed first
    Graceful,
    /// Queued writes were dropped
    Immediate,
}

/// Connection handle feeding a tokio channel drained by the socket writer.
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Mutex<Option<CloseMode>>,
    idle_timeout: Mutex<Option<Duration>>,
}

impl ChannelConnection {
    /// Create a handle and the receiver the writer task drains.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            tx,
            closed: Mutex::new(None),
            idle_timeout: Mutex::new(None),
        });
        (connection, rx)
    }

    /// How the connection was closed, if it was.
    #[must_use]
    pub fn close_mode(&self) -> Option<CloseMode> {
        *self.closed.lock()
    }

    /// Whether the connection was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_mode().is_some()
    }

    /// Idle timeout configured by the processor.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        *self.idle_timeout.lock()
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn write(&self, message: Outbound) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.tx.send(message).map_err(|_| ConnectionError::Closed)
    }

    fn close(&self, graceful: bool) -> Result<(), ConnectionError> {
        let mode = if graceful {
            CloseMode::Graceful
        } else {
            CloseMode::Immediate
        };
        let mut closed = self.closed.lock();
        if closed.is_none() {
            tracing::debug!(connection_id = %self.id, ?mode, "Closing connection");
            *closed = Some(mode);
        }
        Ok(())
    }

    fn set_idle_timeout(&self, timeout: Duration) {
        *self.idle_timeout.lock() = Some(timeout);
    }
}
