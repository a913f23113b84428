//! Message transport collaborator interface.
//!
//! A transport owns connection establishment and delivers whole messages,
//! so the gateway never deals with stream segmentation. All operations are
//! non-blocking. Status changes are queued by the transport and handed to an
//! [`EventSink`](crate::events::EventSink) when the owner pumps callbacks.

use crate::identity::{ConnectionHandle, Identity};

/// Transport-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No connection (the state before the first notification).
    None,
    /// A peer is knocking; the owner must `accept` or `close` it.
    Connecting,
    /// Fully established, messages flow.
    Connected,
    /// The peer closed the connection.
    ClosedByPeer,
    /// The transport detected a fault (reset, protocol error, timeout).
    ProblemDetectedLocally,
}

impl TransportState {
    /// Whether this state ends the connection.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::ClosedByPeer | Self::ProblemDetectedLocally)
    }
}

/// Status-change notification for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Affected connection.
    pub handle: ConnectionHandle,
    /// State before the change.
    pub old_state: TransportState,
    /// State after the change.
    pub new_state: TransportState,
    /// Identity asserted by the peer, known once connected.
    pub remote_identity: Option<Identity>,
    /// Human-readable reason for closed states.
    pub end_reason: Option<String>,
}

/// One received message and its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Sending connection.
    pub handle: ConnectionHandle,
    /// Whole message payload.
    pub payload: Vec<u8>,
}

/// Errors surfaced by transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The handle is not (or no longer) known to the transport.
    #[error("unknown connection {0}")]
    UnknownHandle(ConnectionHandle),
    /// The operation is not valid in the connection's current state.
    #[error("connection {handle} is {state:?}")]
    InvalidState {
        /// Affected connection.
        handle: ConnectionHandle,
        /// Its current state.
        state: TransportState,
    },
    /// The connection's outbound path is gone.
    #[error("connection {0} is closed")]
    Closed(ConnectionHandle),
    /// The message exceeds the transport's size limit.
    #[error("message of {size} bytes to connection {handle} exceeds the limit")]
    MessageTooLarge {
        /// Target connection.
        handle: ConnectionHandle,
        /// Message size.
        size: usize,
    },
    /// The shared receive queue can no longer deliver messages.
    #[error("receive queue closed")]
    QueueClosed,
}

/// Server-side transport operations consumed by the gateway.
pub trait Transport: Send + Sync {
    /// Accept a connection reported as [`TransportState::Connecting`].
    fn accept(&self, handle: ConnectionHandle) -> Result<(), TransportError>;

    /// Close a connection, flushing already queued messages. Idempotent.
    fn close(&self, handle: ConnectionHandle, reason: &str);

    /// Queue a reliable message on a connected handle.
    fn send(&self, handle: ConnectionHandle, payload: &[u8]) -> Result<(), TransportError>;

    /// Drain up to `max` messages from every connection (the poll group).
    fn receive_batch(&self, max: usize) -> Result<Vec<IncomingMessage>, TransportError>;

    /// Release transport resources. Called after every connection is closed.
    fn shutdown(&self);
}
