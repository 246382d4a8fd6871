//! Real-time chat relay over TCP.
//!
//! Clients connect, register a display name, and exchange broadcast and
//! private messages through one server process. Each module covers one
//! concern:
//!
//! - [`registry`] is the table of online sessions and the only shared
//!   mutable state.
//! - [`session`] defines the per-session handle: a bounded outbound queue
//!   plus a close signal.
//! - [`router`] resolves destinations through the registry and enqueues
//!   frames, isolating failures per destination.
//! - [`connection`] runs the handshake, read loop and teardown for one
//!   socket, and owns that socket's writer.
//! - [`server`] accepts connections and coordinates shutdown.
//! - [`protocol`] classifies raw lines into frames, for both the text and
//!   the JSON line encodings.
//! - [`message`] is the validated unit that gets routed and recorded.
//! - [`history`] keeps recent messages for replay.
//! - [`cli`], [`config`] and [`client`] back the binary.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
