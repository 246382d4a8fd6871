//! Line-oriented wire protocol.
//!
//! Every frame is one `\n`-terminated line. Two encodings share the same
//! frame types:
//!
//! - [`WireFormat::Text`] is the human-readable protocol that works with
//!   `nc`: the first line is the desired name, slash commands control the
//!   session and anything else is chat.
//! - [`WireFormat::Json`] carries the same frames as internally tagged JSON
//!   objects, one per line.
//!
//! Raw lines are classified into [`ClientFrame`] exactly once, here. Nothing
//! past this module inspects client text for commands.

use std::io;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::FrameError,
    message::{Message, MessageKind},
};

const LINE_ENDINGS: &[u8] = b"\r\n";

pub const USER_LIST_PREFIX: &str = "/userlist";
pub const PM_USAGE: &str = "/pm <username> <message>";
const REQUEST_USAGE: &str = "/request <username>";
const ACCEPT_USAGE: &str = "/accept <username>";
const DECLINE_USAGE: &str = "/decline <username>";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { name: String },
    Say { text: String },
    Direct { to: String, text: String },
    List,
    Quit,
    ChatRequest { to: String },
    ChatAccept { to: String },
    ChatDecline { to: String },
}

impl ClientFrame {
    /// Classifies one text-protocol line typed by a user.
    pub fn parse_command(line: &str) -> Result<Self, FrameError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(FrameError::Blank);
        }
        if !line.starts_with('/') {
            return Ok(ClientFrame::Say {
                text: line.to_string(),
            });
        }

        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match command.to_ascii_lowercase().as_str() {
            "/quit" if rest.is_empty() => Ok(ClientFrame::Quit),
            "/list" if rest.is_empty() => Ok(ClientFrame::List),
            "/pm" => parse_direct(rest),
            "/request" => Ok(ClientFrame::ChatRequest {
                to: single_name(rest, REQUEST_USAGE)?,
            }),
            "/accept" => Ok(ClientFrame::ChatAccept {
                to: single_name(rest, ACCEPT_USAGE)?,
            }),
            "/decline" => Ok(ClientFrame::ChatDecline {
                to: single_name(rest, DECLINE_USAGE)?,
            }),
            _ => Err(FrameError::UnknownCommand(line.to_string())),
        }
    }

    /// Text-protocol rendering, the inverse of [`ClientFrame::parse_command`].
    pub fn to_text(&self) -> String {
        match self {
            ClientFrame::Join { name } => name.clone(),
            ClientFrame::Say { text } => text.clone(),
            ClientFrame::Direct { to, text } => format!("/pm {to} {text}"),
            ClientFrame::List => "/list".to_string(),
            ClientFrame::Quit => "/quit".to_string(),
            ClientFrame::ChatRequest { to } => format!("/request {to}"),
            ClientFrame::ChatAccept { to } => format!("/accept {to}"),
            ClientFrame::ChatDecline { to } => format!("/decline {to}"),
        }
    }
}

// `/pm <target> <body>`: split on the first delimiter only so the body keeps its spacing.
fn parse_direct(rest: &str) -> Result<ClientFrame, FrameError> {
    let (to, text) = rest.split_once(' ').ok_or(FrameError::Usage(PM_USAGE))?;
    let text = text.trim();
    if to.is_empty() || text.is_empty() {
        return Err(FrameError::Usage(PM_USAGE));
    }
    Ok(ClientFrame::Direct {
        to: to.to_string(),
        text: text.to_string(),
    })
}

fn single_name(rest: &str, usage: &'static str) -> Result<String, FrameError> {
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return Err(FrameError::Usage(usage));
    }
    Ok(rest.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    System { text: String },
    Chat { from: String, text: String },
    Private { from: String, text: String },
    UserList { names: Vec<String> },
    ChatRequest { from: String },
    ChatAccept { from: String },
    ChatDecline { from: String },
}

impl ServerFrame {
    pub fn system(text: impl Into<String>) -> Self {
        ServerFrame::System { text: text.into() }
    }

    pub fn to_text(&self) -> String {
        match self {
            ServerFrame::System { text } => format!("[SYSTEM] {text}"),
            ServerFrame::Chat { from, text } => format!("[{from}] {text}"),
            ServerFrame::Private { from, text } => format!("[PM from {from}] {text}"),
            ServerFrame::UserList { names } => format!("{USER_LIST_PREFIX} {}", names.join(",")),
            ServerFrame::ChatRequest { from } => format!("[CHAT_REQUEST from {from}]"),
            ServerFrame::ChatAccept { from } => format!("[CHAT_ACCEPT from {from}]"),
            ServerFrame::ChatDecline { from } => format!("[CHAT_DECLINE from {from}]"),
        }
    }

    /// Parses a text-protocol server line. Returns `None` for lines that do
    /// not match any known shape.
    pub fn parse_text(line: &str) -> Option<Self> {
        if let Some(rest) = line.strip_prefix(USER_LIST_PREFIX) {
            if !rest.is_empty() && !rest.starts_with(' ') {
                return None;
            }
            let names = rest
                .trim()
                .split(',')
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            return Some(ServerFrame::UserList { names });
        }
        if let Some(text) = line.strip_prefix("[SYSTEM] ") {
            return Some(ServerFrame::system(text));
        }
        if let Some(rest) = line.strip_prefix("[PM from ") {
            let (from, text) = rest.split_once("] ")?;
            return Some(ServerFrame::Private {
                from: from.to_string(),
                text: text.to_string(),
            });
        }
        for (prefix, build) in [
            ("[CHAT_REQUEST from ", chat_request as fn(String) -> ServerFrame),
            ("[CHAT_ACCEPT from ", chat_accept),
            ("[CHAT_DECLINE from ", chat_decline),
        ] {
            if let Some(rest) = line.strip_prefix(prefix) {
                return rest.strip_suffix(']').map(|from| build(from.to_string()));
            }
        }
        let (from, text) = line.strip_prefix('[')?.split_once("] ")?;
        Some(ServerFrame::Chat {
            from: from.to_string(),
            text: text.to_string(),
        })
    }
}

fn chat_request(from: String) -> ServerFrame {
    ServerFrame::ChatRequest { from }
}

fn chat_accept(from: String) -> ServerFrame {
    ServerFrame::ChatAccept { from }
}

fn chat_decline(from: String) -> ServerFrame {
    ServerFrame::ChatDecline { from }
}

impl From<&Message> for ServerFrame {
    fn from(message: &Message) -> Self {
        let from = message.from().to_string();
        match message.kind() {
            MessageKind::Broadcast => ServerFrame::Chat {
                from,
                text: message.content().to_string(),
            },
            MessageKind::Direct => ServerFrame::Private {
                from,
                text: message.content().to_string(),
            },
            MessageKind::ChatRequest => ServerFrame::ChatRequest { from },
            MessageKind::ChatAccept => ServerFrame::ChatAccept { from },
            MessageKind::ChatDecline => ServerFrame::ChatDecline { from },
            MessageKind::UserListSync => ServerFrame::UserList {
                names: message
                    .content()
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            MessageKind::System | MessageKind::Join | MessageKind::Leave | MessageKind::Quit => {
                ServerFrame::system(message.content())
            }
        }
    }
}

/// Reads the desired name out of the first frame of a connection.
///
/// The returned name is trimmed and may be empty; deciding what to do with a
/// blank name is up to the caller.
pub fn decode_handshake(line: &str, wire: WireFormat) -> Result<String, FrameError> {
    match wire {
        WireFormat::Text => Ok(line.trim().to_string()),
        WireFormat::Json => match serde_json::from_str::<ClientFrame>(line)? {
            ClientFrame::Join { name } => Ok(name.trim().to_string()),
            _ => Err(FrameError::ExpectedJoin),
        },
    }
}

pub fn decode_client(line: &str, wire: WireFormat) -> Result<ClientFrame, FrameError> {
    match wire {
        WireFormat::Text => ClientFrame::parse_command(line),
        WireFormat::Json => {
            if line.trim().is_empty() {
                return Err(FrameError::Blank);
            }
            Ok(serde_json::from_str(line)?)
        }
    }
}

pub fn encode_client(frame: &ClientFrame, wire: WireFormat) -> Result<String, serde_json::Error> {
    match wire {
        WireFormat::Text => Ok(frame.to_text()),
        WireFormat::Json => serde_json::to_string(frame),
    }
}

pub fn decode_server(line: &str, wire: WireFormat) -> Result<ServerFrame, FrameError> {
    match wire {
        WireFormat::Text => {
            ServerFrame::parse_text(line).ok_or_else(|| FrameError::Unrecognized(line.to_string()))
        }
        WireFormat::Json => Ok(serde_json::from_str(line)?),
    }
}

pub fn encode_server(frame: &ServerFrame, wire: WireFormat) -> Result<String, serde_json::Error> {
    match wire {
        WireFormat::Text => Ok(frame.to_text()),
        WireFormat::Json => serde_json::to_string(frame),
    }
}

/// Reads the next line, without its line ending. Blank lines are returned as
/// empty strings; `Ok(None)` means the peer closed the stream.
///
/// At most `limit` bytes of one line are buffered. A longer line is consumed
/// up to its newline and reported as [`FrameError::Oversized`], and a line
/// that is not UTF-8 as [`FrameError::InvalidUtf8`]. Either way the reader
/// is left at the start of the next frame.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<String>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut seen_any = false;
    let mut oversized = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        seen_any = true;
        let (used, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        if !oversized {
            line.extend_from_slice(&available[..used]);
            if line.len() > limit {
                oversized = true;
                line = Vec::new();
            }
        }
        reader.consume(used);
        if complete {
            break;
        }
    }

    if !seen_any {
        return Ok(None);
    }
    if oversized {
        return Err(FrameError::Oversized { limit });
    }
    while line.last().is_some_and(|b| LINE_ENDINGS.contains(b)) {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| FrameError::InvalidUtf8)
}

pub async fn write_frame<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Append the delimiter and flush so peers get timely updates.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
