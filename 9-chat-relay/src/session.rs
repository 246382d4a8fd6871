//! Per-session handle shared between a connection and the registry.

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{error::DeliveryError, protocol::ServerFrame};

pub type SessionId = u64;

/// Names that would be ambiguous on the text protocol.
const RESERVED_NAMES: &[&str] = &["system", "server"];

/// Lifecycle of one connection. Never goes backwards and is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_become(self, next: SessionState) -> bool {
        match (self, next) {
            (SessionState::Connecting, SessionState::Active) => true,
            (SessionState::Connecting | SessionState::Active, SessionState::Closing) => true,
            (SessionState::Closing, SessionState::Closed) => true,
            _ => false,
        }
    }
}

/// Key used for uniqueness and lookup. Display names keep their casing.
pub fn fold_name(name: &str) -> String {
    name.to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameCheck {
    Blank,
    TooLong { max: usize },
    BadCharacter(char),
    Reserved,
    Ok,
}

pub fn check_name(name: &str, max_len: usize) -> NameCheck {
    if name.trim().is_empty() {
        return NameCheck::Blank;
    }
    if name.chars().count() > max_len {
        return NameCheck::TooLong { max: max_len };
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return NameCheck::BadCharacter(bad);
    }
    if RESERVED_NAMES.contains(&fold_name(name).as_str()) {
        return NameCheck::Reserved;
    }
    NameCheck::Ok
}

/// Cloneable handle to a live session.
///
/// The outbound queue is drained only by the owning connection's writer.
/// Everyone else may enqueue through [`SessionHandle::send`] and nothing more.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    name: String,
    outbound: mpsc::Sender<ServerFrame>,
    closer: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        name: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (outbound, inbox) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            name: name.into(),
            outbound,
            closer: CancellationToken::new(),
        };
        (handle, inbox)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> String {
        fold_name(&self.name)
    }

    /// Enqueues a frame without waiting. A full or closed queue is reported,
    /// never awaited.
    pub fn send(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        if self.closer.is_cancelled() {
            return Err(DeliveryError::Disconnected);
        }
        self.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }

    /// Enqueues a frame for this session's own connection, waiting for room.
    /// Used only by the owning handler for its replies.
    pub async fn enqueue(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        tokio::select! {
            biased;
            _ = self.closer.cancelled() => Err(DeliveryError::Disconnected),
            sent = self.outbound.send(frame) => sent.map_err(|_| DeliveryError::Disconnected),
        }
    }

    /// Requests the connection to close. Safe to call any number of times.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.closer.clone()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
