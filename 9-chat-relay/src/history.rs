//! Optional message history.
//!
//! Recording is best-effort and independent of delivery: a store error
//! downgrades a message to "sent but not recorded" and is only logged by the
//! caller.

use std::{collections::VecDeque, sync::Mutex};

use crate::{
    error::HistoryError,
    message::{Message, MessageKind, Recipient},
    session::fold_name,
};

pub type MessageId = u64;

/// Which conversation to read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryScope {
    /// Public broadcasts.
    Global,
    /// Direct messages exchanged between two names, in either direction.
    Between(String, String),
}

impl HistoryScope {
    fn matches(&self, message: &Message) -> bool {
        match self {
            HistoryScope::Global => {
                message.kind() == MessageKind::Broadcast && *message.to() == Recipient::All
            }
            HistoryScope::Between(a, b) => {
                let Some(to) = message.target() else {
                    return false;
                };
                if message.kind() != MessageKind::Direct {
                    return false;
                }
                let (from, to) = (fold_name(message.from()), fold_name(to));
                let (a, b) = (fold_name(a), fold_name(b));
                (from == a && to == b) || (from == b && to == a)
            }
        }
    }
}

pub trait HistoryStore: Send + Sync {
    fn append(&self, message: &Message) -> Result<MessageId, HistoryError>;

    /// Up to `limit` of the most recent messages in `scope`, oldest first.
    fn recent(&self, scope: &HistoryScope, limit: usize) -> Result<Vec<Message>, HistoryError>;
}

/// Bounded in-memory history. The oldest records are evicted first.
pub struct MemoryHistory {
    capacity: usize,
    records: Mutex<Records>,
}

#[derive(Default)]
struct Records {
    next_id: MessageId,
    entries: VecDeque<(MessageId, Message)>,
}

impl MemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(Records::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .map(|records| records.entries.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryStore for MemoryHistory {
    fn append(&self, message: &Message) -> Result<MessageId, HistoryError> {
        let mut records = self
            .records
            .lock()
            .map_err(|err| HistoryError::Unavailable(err.to_string()))?;
        records.next_id += 1;
        let id = records.next_id;
        if self.capacity == 0 {
            return Ok(id);
        }
        while records.entries.len() >= self.capacity {
            records.entries.pop_front();
        }
        records.entries.push_back((id, message.clone()));
        Ok(id)
    }

    fn recent(&self, scope: &HistoryScope, limit: usize) -> Result<Vec<Message>, HistoryError> {
        let records = self
            .records
            .lock()
            .map_err(|err| HistoryError::Unavailable(err.to_string()))?;
        let mut picked: Vec<Message> = records
            .entries
            .iter()
            .rev()
            .filter(|(_, message)| scope.matches(message))
            .take(limit)
            .map(|(_, message)| message.clone())
            .collect();
        picked.reverse();
        Ok(picked)
    }
}
