use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result, anyhow};
use chat_relay::{
    config::ServerConfig,
    protocol::{read_frame, write_frame},
    server::{SHUTDOWN_NOTICE, Server, ServerHandle},
};
use tokio::{
    io::BufReader,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const FRAME_LIMIT: usize = 64 * 1024;

struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    /// Opens a socket without sending a handshake.
    async fn open(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn connect(addr: SocketAddr, name: &str) -> Result<Self> {
        let mut peer = Self::open(addr).await?;
        peer.send(name).await?;
        Ok(peer)
    }

    /// Connects and consumes the greeting up to the first user list.
    async fn join(addr: SocketAddr, name: &str) -> Result<Self> {
        let mut peer = Self::connect(addr, name).await?;
        let welcome = peer.line().await?;
        assert_eq!(
            welcome,
            format!("[SYSTEM] Welcome, {name}! You are now connected.")
        );
        peer.skip_until(|line| line.starts_with("/userlist")).await?;
        Ok(peer)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        write_frame(&mut self.writer, line).await?;
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<String>> {
        timeout(READ_TIMEOUT, read_frame(&mut self.reader, FRAME_LIMIT))
            .await
            .context("timed out waiting for server line")?
            .context("failed to read server line")
    }

    async fn line(&mut self) -> Result<String> {
        self.next()
            .await?
            .ok_or_else(|| anyhow!("server closed the connection"))
    }

    async fn skip_until(&mut self, wanted: impl Fn(&str) -> bool) -> Result<String> {
        loop {
            let line = self.line().await?;
            if wanted(&line) {
                return Ok(line);
            }
        }
    }

    async fn expect_eof(&mut self) -> Result<()> {
        match self.next().await? {
            None => Ok(()),
            Some(line) => Err(anyhow!("expected EOF, got '{line}'")),
        }
    }
}

async fn spawn_server() -> Result<ServerHandle> {
    Server::bind(ServerConfig::with_port(0)).await?.spawn()
}

#[tokio::test]
async fn broadcasts_reach_every_participant() -> Result<()> {
    let server = spawn_server().await?;
    let addr = server.local_addr();

    let mut alice = Peer::join(addr, "alice").await?;
    let mut bob = Peer::join(addr, "bob").await?;

    assert_eq!(alice.line().await?, "[SYSTEM] bob has joined the chat.");
    assert_eq!(alice.line().await?, "/userlist alice,bob");

    alice.send("hello bob").await?;
    assert_eq!(bob.line().await?, "[alice] hello bob");
    assert_eq!(alice.line().await?, "[alice] hello bob");

    server.shutdown().await
}

#[tokio::test]
async fn private_message_to_offline_user_is_reported_to_sender_only() -> Result<()> {
    let server = spawn_server().await?;
    let addr = server.local_addr();

    let mut alice = Peer::join(addr, "alice").await?;
    let mut carol = Peer::join(addr, "carol").await?;
    alice.skip_until(|line| line == "/userlist alice,carol").await?;

    alice.send("/pm bob are you there?").await?;
    assert_eq!(alice.line().await?, "[SYSTEM] User 'bob' is not online.");

    alice.send("/pm carol psst").await?;
    assert_eq!(carol.line().await?, "[PM from alice] psst");

    server.shutdown().await
}

#[tokio::test]
async fn concurrent_duplicate_names_admit_exactly_one() -> Result<()> {
    let server = spawn_server().await?;
    let addr = server.local_addr();

    let (first, second) = tokio::join!(
        Peer::connect(addr, "alice"),
        Peer::connect(addr, "alice")
    );
    let mut peers = [first?, second?];

    let mut admitted = 0;
    let mut rejected = 0;
    for peer in &mut peers {
        let line = peer.line().await?;
        if line == "[SYSTEM] Welcome, alice! You are now connected." {
            admitted += 1;
        } else {
            assert_eq!(line, "[SYSTEM] Username 'alice' is already in use.");
            peer.expect_eof().await?;
            rejected += 1;
        }
    }

    assert_eq!((admitted, rejected), (1, 1));
    assert_eq!(server.registry().count().await, 1);

    server.shutdown().await
}

#[tokio::test]
async fn quitting_updates_the_remaining_users() -> Result<()> {
    let server = spawn_server().await?;
    let addr = server.local_addr();

    let mut alice = Peer::join(addr, "alice").await?;
    let mut bob = Peer::join(addr, "bob").await?;
    alice.skip_until(|line| line == "/userlist alice,bob").await?;

    alice.send("/quit").await?;
    alice.expect_eof().await?;

    assert_eq!(bob.line().await?, "[SYSTEM] alice has left the chat.");
    assert_eq!(bob.line().await?, "/userlist bob");

    bob.send("/list").await?;
    assert_eq!(bob.line().await?, "[SYSTEM] Online users (1): bob");

    server.shutdown().await
}

#[tokio::test]
async fn shutdown_notifies_and_disconnects_clients() -> Result<()> {
    let server = spawn_server().await?;
    let addr = server.local_addr();

    let mut alice = Peer::join(addr, "alice").await?;
    let registry = server.registry().clone();

    server.shutdown().await?;

    alice
        .skip_until(|line| line == format!("[SYSTEM] {SHUTDOWN_NOTICE}"))
        .await?;
    alice.expect_eof().await?;
    assert_eq!(registry.count().await, 0);
    assert!(TcpStream::connect(addr).await.is_err());

    Ok(())
}

#[tokio::test]
async fn names_are_unique_regardless_of_case() -> Result<()> {
    let server = spawn_server().await?;
    let addr = server.local_addr();

    let _alice = Peer::join(addr, "Alice").await?;
    let mut impostor = Peer::connect(addr, "alice").await?;

    assert_eq!(
        impostor.line().await?,
        "[SYSTEM] Username 'alice' is already in use."
    );
    impostor.expect_eof().await?;

    server.shutdown().await
}

#[tokio::test]
async fn handshake_finished_during_shutdown_is_not_admitted() -> Result<()> {
    let server = spawn_server().await?;
    let addr = server.local_addr();

    let _alice = Peer::join(addr, "alice").await?;
    let mut late = Peer::open(addr).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let registry = server.registry().clone();
    server.trigger_shutdown();
    // The socket may already be gone; only the outcome below matters.
    let _ = late.send("latecomer").await;
    server.shutdown().await?;

    assert_eq!(registry.count().await, 0);
    assert!(registry.snapshot_names().await.is_empty());
    while let Ok(Some(line)) = late.next().await {
        assert!(
            !line.starts_with("[SYSTEM] Welcome"),
            "latecomer was admitted: {line}"
        );
    }

    Ok(())
}
