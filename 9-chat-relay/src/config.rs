use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::protocol::WireFormat;

pub const DEFAULT_PORT: u16 = 9090;
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 1000;
pub const DEFAULT_MAX_NAME_LEN: usize = 20;
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;
pub const DEFAULT_HISTORY_REPLAY: usize = 50;
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Room in a frame for the command word, target name and JSON envelope.
const FRAME_OVERHEAD: usize = 256;
/// Worst-case bytes per character once JSON-escaped (`\u001f`).
const BYTES_PER_CHAR: usize = 6;

/// Everything the server needs to run. Built from the CLI by the binary and
/// directly by tests.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub wire: WireFormat,
    pub max_message_len: usize,
    pub max_name_len: usize,
    /// Frames a session may have queued before deliveries to it fail.
    pub outbound_capacity: usize,
    /// Recent broadcasts replayed to a newly joined session.
    pub history_replay: usize,
    pub history_capacity: usize,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            ..Self::default()
        }
    }

    /// Longest raw line, in bytes, read from a client before it is dropped as
    /// malformed.
    pub fn frame_limit(&self) -> usize {
        self.max_message_len
            .max(self.max_name_len)
            .saturating_mul(BYTES_PER_CHAR)
            .saturating_add(FRAME_OVERHEAD)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            wire: WireFormat::Text,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            max_name_len: DEFAULT_MAX_NAME_LEN,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            history_replay: DEFAULT_HISTORY_REPLAY,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_limit_leaves_room_for_a_full_json_message() {
        let config = ServerConfig::default();
        assert_eq!(config.frame_limit(), 1000 * 6 + 256);

        let tiny = ServerConfig {
            max_message_len: 5,
            ..ServerConfig::default()
        };
        assert_eq!(tiny.frame_limit(), 20 * 6 + 256);
    }
}
