//! Error taxonomy for the relay.
//!
//! Each enum belongs to one layer: registration, routing, per-destination
//! delivery, frame decoding, message construction, and history storage.
//! Connection-level I/O failures are not modelled here; they surface as
//! `anyhow::Error` from the connection task and only ever close that one
//! connection.

use thiserror::Error;

use crate::message::MessageKind;

/// Rejection from [`crate::registry::Registry::register`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("name '{0}' is already in use")]
    NameTaken(String),
    #[error("server is shutting down")]
    Closed,
}

/// Failure to push a frame into one session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The peer is not draining its queue fast enough.
    #[error("outbound queue is full")]
    QueueFull,
    /// The session's writer has already gone away.
    #[error("session is disconnected")]
    Disconnected,
}

/// Outcome of a routing request that could not be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("user '{0}' is not online")]
    NotOnline(String),
    #[error("{kind:?} message has an invalid recipient")]
    InvalidRecipient { kind: MessageKind },
    #[error("{0:?} messages are handled by the connection, not routed")]
    NotRoutable(MessageKind),
    #[error("delivery to '{name}' failed: {source}")]
    Delivery {
        name: String,
        #[source]
        source: DeliveryError,
    },
}

/// A frame that could not be read or classified.
///
/// Every variant except [`FrameError::Io`] is a malformed frame: the
/// connection skips it and keeps going.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("frame exceeds {limit} bytes")]
    Oversized { limit: usize },
    #[error("empty frame")]
    Blank,
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("expected a join frame first")]
    ExpectedJoin,
    #[error("unrecognized frame: {0}")]
    Unrecognized(String),
    #[error("invalid json frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Rejected message construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("{kind:?} message has an invalid recipient")]
    InvalidRecipient { kind: MessageKind },
    #[error("message is too long ({len} > {max} characters)")]
    TooLong { len: usize, max: usize },
}

/// Failure reported by a [`crate::history::HistoryStore`].
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history store is unavailable: {0}")]
    Unavailable(String),
}
