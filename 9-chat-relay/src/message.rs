//! The routed unit exchanged between sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// Sender name used for server-originated messages.
pub const SERVER_NAME: &str = "SERVER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Join,
    Leave,
    UserListSync,
    ChatRequest,
    ChatAccept,
    ChatDecline,
    Broadcast,
    Direct,
    System,
    Quit,
}

/// Where a message is headed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "snake_case")]
pub enum Recipient {
    All,
    User(String),
    Nobody,
}

impl MessageKind {
    /// Whether `to` is acceptable for this kind.
    pub fn accepts(self, to: &Recipient) -> bool {
        match self {
            MessageKind::Broadcast | MessageKind::UserListSync => *to == Recipient::All,
            MessageKind::Direct
            | MessageKind::ChatRequest
            | MessageKind::ChatAccept
            | MessageKind::ChatDecline => matches!(to, Recipient::User(name) if !name.is_empty()),
            MessageKind::System => true,
            MessageKind::Join | MessageKind::Leave | MessageKind::Quit => {
                matches!(to, Recipient::All | Recipient::Nobody)
            }
        }
    }
}

/// A validated, immutable chat message.
///
/// `sent_at` is stamped here, on the server, when the frame is decoded. Nothing
/// the client sends can influence it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    kind: MessageKind,
    from: String,
    to: Recipient,
    content: String,
    sent_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        from: impl Into<String>,
        to: Recipient,
        content: impl Into<String>,
        max_len: usize,
    ) -> Result<Self, MessageError> {
        if !kind.accepts(&to) {
            return Err(MessageError::InvalidRecipient { kind });
        }
        let content = content.into();
        let len = content.chars().count();
        if len > max_len {
            return Err(MessageError::TooLong { len, max: max_len });
        }
        Ok(Self {
            kind,
            from: from.into(),
            to,
            content,
            sent_at: Utc::now(),
        })
    }

    /// Server-originated notice with no `from` session.
    pub fn system(to: Recipient, content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::System,
            from: SERVER_NAME.to_string(),
            to,
            content: content.into(),
            sent_at: Utc::now(),
        }
    }

    /// User-list sync carrying the online names, comma separated, in order.
    pub fn user_list(names: &[String]) -> Self {
        Self {
            kind: MessageKind::UserListSync,
            from: SERVER_NAME.to_string(),
            to: Recipient::All,
            content: names.join(","),
            sent_at: Utc::now(),
        }
    }

    pub fn broadcast(
        from: impl Into<String>,
        content: impl Into<String>,
        max_len: usize,
    ) -> Result<Self, MessageError> {
        Self::new(MessageKind::Broadcast, from, Recipient::All, content, max_len)
    }

    pub fn direct(
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
        max_len: usize,
    ) -> Result<Self, MessageError> {
        Self::new(MessageKind::Direct, from, Recipient::User(to.into()), content, max_len)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &Recipient {
        &self.to
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    /// Target name for messages addressed to one session.
    pub fn target(&self) -> Option<&str> {
        match &self.to {
            Recipient::User(name) => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_requires_all() {
        let err = Message::new(
            MessageKind::Broadcast,
            "alice",
            Recipient::User("bob".into()),
            "hi",
            100,
        )
        .unwrap_err();
        assert_eq!(
            err,
            MessageError::InvalidRecipient {
                kind: MessageKind::Broadcast
            }
        );
        assert!(Message::broadcast("alice", "hi", 100).is_ok());
    }

    #[test]
    fn direct_kinds_require_a_named_target() {
        for kind in [
            MessageKind::Direct,
            MessageKind::ChatRequest,
            MessageKind::ChatAccept,
            MessageKind::ChatDecline,
        ] {
            assert!(!kind.accepts(&Recipient::All));
            assert!(!kind.accepts(&Recipient::Nobody));
            assert!(!kind.accepts(&Recipient::User(String::new())));
            assert!(kind.accepts(&Recipient::User("bob".into())));
        }
    }

    #[test]
    fn content_length_is_bounded_in_characters() {
        let body = "é".repeat(10);
        assert!(Message::broadcast("alice", body.clone(), 10).is_ok());
        let err = Message::broadcast("alice", format!("{body}x"), 10).unwrap_err();
        assert_eq!(err, MessageError::TooLong { len: 11, max: 10 });
    }

    #[test]
    fn system_messages_come_from_the_server() {
        let message = Message::system(Recipient::All, "maintenance soon");
        assert_eq!(message.kind(), MessageKind::System);
        assert_eq!(message.from(), SERVER_NAME);
        assert_eq!(message.target(), None);
    }

    #[test]
    fn sent_at_is_stamped_on_construction() {
        let before = Utc::now();
        let message = Message::direct("alice", "bob", "hi", 100).expect("valid direct");
        assert!(message.sent_at() >= before);
        assert!(message.sent_at() <= Utc::now());
        assert_eq!(message.target(), Some("bob"));
    }
}
