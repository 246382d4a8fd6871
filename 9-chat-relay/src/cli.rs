use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{config::ServerConfig, protocol::WireFormat};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub listen: SocketAddr,

    /// Frame encoding spoken on every connection.
    #[arg(long, value_enum, default_value_t = WireFormat::Text)]
    pub wire: WireFormat,

    /// Longest accepted message body, in characters.
    #[arg(long, default_value_t = 1000)]
    pub max_message_len: usize,

    /// Longest accepted display name, in characters.
    #[arg(long, default_value_t = 20)]
    pub max_name_len: usize,

    /// Frames queued per session before deliveries to it start failing.
    #[arg(long, default_value_t = 64)]
    pub outbound_capacity: usize,

    /// Recent broadcasts replayed to each newly joined session. 0 disables replay.
    #[arg(long, default_value_t = 50)]
    pub history_replay: usize,

    /// Messages kept in the in-memory history.
    #[arg(long, default_value_t = 1000)]
    pub history_capacity: usize,

    /// Seconds to wait for connections to finish after a shutdown.
    #[arg(long, default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            listen: args.listen,
            wire: args.wire,
            max_message_len: args.max_message_len,
            max_name_len: args.max_name_len,
            outbound_capacity: args.outbound_capacity,
            history_replay: args.history_replay,
            history_capacity: args.history_capacity,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name used when joining the chat.
    #[arg(long)]
    pub name: String,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub server: SocketAddr,

    /// Frame encoding the server speaks.
    #[arg(long, value_enum, default_value_t = WireFormat::Text)]
    pub wire: WireFormat,
}
