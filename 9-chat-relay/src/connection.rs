//! One task per accepted socket.
//!
//! A connection reads exactly one handshake frame, registers its name, and
//! then loops on reading frames until the peer quits, disconnects, or the
//! session is force-closed. Its socket's write half belongs to a writer task
//! that drains the session's private outbound queue, so nothing outside this
//! module ever writes to the socket.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    error::{FrameError, MessageError, RegisterError, RouteError},
    history::{HistoryScope, HistoryStore},
    message::{Message, MessageKind, Recipient},
    protocol::{
        ClientFrame, PM_USAGE, ServerFrame, WireFormat, decode_client, decode_handshake,
        encode_server, read_frame, write_frame,
    },
    router::{DeliveryReport, Router},
    server::SHUTDOWN_NOTICE,
    session::{NameCheck, SessionHandle, SessionState, check_name, fold_name},
};

/// How long a closing connection waits for its writer to flush queued frames.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by every connection of one server.
pub struct ConnectionContext {
    pub config: ServerConfig,
    pub router: Router,
    pub history: Arc<dyn HistoryStore>,
    /// Cancelled once the server starts shutting down.
    pub shutdown: CancellationToken,
}

pub async fn handle_connection(stream: TcpStream, ctx: Arc<ConnectionContext>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    serve(BufReader::new(reader), writer, peer, ctx).await
}

/// Runs the full lifecycle of one client over an arbitrary byte stream.
pub async fn serve<R, W>(
    mut reader: R,
    mut writer: W,
    peer: Option<SocketAddr>,
    ctx: Arc<ConnectionContext>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Some(name) = perform_handshake(&mut reader, &mut writer, &ctx, peer).await? else {
        shutdown_writer(&mut writer).await;
        return Ok(());
    };

    let registry = ctx.router.registry();
    let (session, inbox) =
        SessionHandle::new(registry.next_id(), &name, ctx.config.outbound_capacity);
    // Queued before the session is visible so nothing routed can overtake it.
    let welcome = ServerFrame::system(format!("Welcome, {name}! You are now connected."));
    if let Err(error) = session.send(welcome) {
        debug!(%name, %error, "failed to queue welcome");
    }
    let mut connection = Connection {
        session,
        state: SessionState::Connecting,
        peer,
        ctx: Arc::clone(&ctx),
        writer: None,
    };

    if let Err(error) = registry.register(connection.session.clone()).await {
        let notice = match error {
            RegisterError::NameTaken(name) => {
                info!(?peer, %name, "rejected duplicate name");
                format!("Username '{name}' is already in use.")
            }
            RegisterError::Closed => {
                debug!(?peer, %name, "refused registration during shutdown");
                SHUTDOWN_NOTICE.to_string()
            }
        };
        connection.transition(SessionState::Closing);
        send_frame(&mut writer, &ServerFrame::system(notice), ctx.config.wire).await?;
        shutdown_writer(&mut writer).await;
        connection.transition(SessionState::Closed);
        return Ok(());
    }

    connection.transition(SessionState::Active);
    connection.writer = Some(tokio::spawn(drain_outbound(
        writer,
        inbox,
        connection.session.close_token(),
        ctx.config.wire,
    )));

    connection.welcome().await;
    let outcome = connection.read_loop(&mut reader).await;
    connection.close().await;
    outcome
}

async fn perform_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    ctx: &ConnectionContext,
    peer: Option<SocketAddr>,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let wire = ctx.config.wire;
    let read = select! {
        biased;
        _ = ctx.shutdown.cancelled() => {
            debug!(?peer, "server shut down before handshake");
            send_frame(writer, &ServerFrame::system(SHUTDOWN_NOTICE), wire).await?;
            return Ok(None);
        }
        read = read_frame(reader, ctx.config.frame_limit()) => read,
    };

    let decoded = match read {
        Ok(None) => {
            debug!(?peer, "connection closed before handshake");
            return Ok(None);
        }
        Ok(Some(line)) if line.trim().is_empty() => {
            debug!(?peer, "blank handshake, closing without registering");
            return Ok(None);
        }
        Ok(Some(line)) => decode_handshake(&line, wire),
        Err(FrameError::Io(error)) => return Err(error).context("failed to read handshake"),
        Err(error) => Err(error),
    };
    let name = match decoded {
        Ok(name) => name,
        Err(error) => {
            debug!(?peer, %error, "malformed handshake");
            let notice = ServerFrame::system("Expected a join frame carrying your username.");
            send_frame(writer, &notice, wire).await?;
            return Ok(None);
        }
    };

    let rejection = match check_name(&name, ctx.config.max_name_len) {
        NameCheck::Ok => return Ok(Some(name)),
        NameCheck::Blank => {
            debug!(?peer, "blank name, closing without registering");
            return Ok(None);
        }
        NameCheck::TooLong { max } => {
            format!("Invalid username: use at most {max} characters.")
        }
        NameCheck::BadCharacter(c) => format!("Invalid username: '{c}' is not allowed."),
        NameCheck::Reserved => format!("Invalid username: '{name}' is reserved."),
    };
    debug!(?peer, %name, "rejected invalid name");
    send_frame(writer, &ServerFrame::system(rejection), wire).await?;
    Ok(None)
}

enum Flow {
    Continue,
    Quit,
}

struct Connection {
    session: SessionHandle,
    state: SessionState,
    peer: Option<SocketAddr>,
    ctx: Arc<ConnectionContext>,
    writer: Option<JoinHandle<io::Result<()>>>,
}

impl Connection {
    fn name(&self) -> &str {
        self.session.name()
    }

    fn router(&self) -> &Router {
        &self.ctx.router
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_become(next),
            "invalid transition {:?} -> {next:?}",
            self.state
        );
        debug!(name = self.name(), from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    async fn welcome(&self) {
        let name = self.name().to_string();
        let online = self.router().registry().count().await;
        info!(peer = ?self.peer, %name, online, "client joined");

        self.notify(format!("{online} user(s) online.")).await;
        self.replay_history().await;

        self.announce(MessageKind::Join, format!("{name} has joined the chat.")).await;
        self.router().sync_user_list().await;
    }

    async fn replay_history(&self) {
        let limit = self.ctx.config.history_replay;
        if limit == 0 {
            return;
        }
        match self.ctx.history.recent(&HistoryScope::Global, limit) {
            Ok(messages) => {
                for message in &messages {
                    if self.session.enqueue(ServerFrame::from(message)).await.is_err() {
                        break;
                    }
                }
            }
            Err(error) => warn!(name = self.name(), %error, "failed to load history"),
        }
    }

    async fn announce(&self, kind: MessageKind, text: String) {
        let notice = match Message::new(kind, self.name(), Recipient::All, text, usize::MAX) {
            Ok(notice) => notice,
            Err(error) => {
                warn!(name = self.name(), %error, "failed to build notice");
                return;
            }
        };
        if let Ok(report) = self.router().route(&notice).await {
            log_failures(&report);
        }
    }

    async fn read_loop<R>(&mut self, reader: &mut R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let closer = self.session.close_token();
        let wire = self.ctx.config.wire;
        let limit = self.ctx.config.frame_limit();
        loop {
            let read = select! {
                biased;
                _ = closer.cancelled() => {
                    debug!(name = self.name(), "session closed by server");
                    return Ok(());
                }
                read = read_frame(reader, limit) => read,
            };
            let decoded = match read {
                Ok(Some(line)) => decode_client(&line, wire),
                Ok(None) => {
                    debug!(name = self.name(), "client closed the connection");
                    return Ok(());
                }
                Err(FrameError::Io(error)) => return Err(error).context("failed to read frame"),
                Err(error) => Err(error),
            };

            match decoded {
                Ok(frame) => {
                    debug!(name = self.name(), ?frame, "frame received");
                    if let Flow::Quit = self.handle_frame(frame).await {
                        return Ok(());
                    }
                }
                Err(FrameError::Blank) => {}
                Err(error @ (FrameError::Usage(_) | FrameError::UnknownCommand(_))) => {
                    self.notify(error.to_string()).await;
                }
                Err(error) => {
                    debug!(name = self.name(), %error, "skipping malformed frame");
                    self.notify("Malformed frame ignored.").await;
                }
            }
        }
    }

    async fn handle_frame(&self, frame: ClientFrame) -> Flow {
        match frame {
            ClientFrame::Say { text } => self.say(text.trim()).await,
            ClientFrame::Direct { to, text } => self.direct(to.trim(), text.trim()).await,
            ClientFrame::List => self.list().await,
            ClientFrame::Quit => return Flow::Quit,
            ClientFrame::ChatRequest { to } => {
                self.request(MessageKind::ChatRequest, to.trim()).await
            }
            ClientFrame::ChatAccept { to } => self.request(MessageKind::ChatAccept, to.trim()).await,
            ClientFrame::ChatDecline { to } => {
                self.request(MessageKind::ChatDecline, to.trim()).await
            }
            ClientFrame::Join { .. } => self.notify("Already connected.").await,
        }
        Flow::Continue
    }

    async fn say(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let Some(message) = self.build(Message::broadcast(
            self.name(),
            text,
            self.ctx.config.max_message_len,
        ))
        .await
        else {
            return;
        };
        self.record(&message);
        if let Ok(report) = self.router().route(&message).await {
            log_failures(&report);
        }
    }

    async fn direct(&self, to: &str, text: &str) {
        if to.is_empty() || text.is_empty() {
            self.notify(format!("Usage: {PM_USAGE}")).await;
            return;
        }
        if self.is_self(to) {
            self.notify("You cannot send a private message to yourself.").await;
            return;
        }
        let Some(message) = self.build(Message::direct(
            self.name(),
            to,
            text,
            self.ctx.config.max_message_len,
        ))
        .await
        else {
            return;
        };
        if self.dispatch_direct(&message).await {
            debug!(from = self.name(), %to, "private message delivered");
            self.record(&message);
        }
    }

    async fn request(&self, kind: MessageKind, to: &str) {
        if self.is_self(to) {
            self.notify("You cannot send a chat request to yourself.").await;
            return;
        }
        let built = Message::new(kind, self.name(), Recipient::User(to.to_string()), "", 0);
        if let Some(message) = self.build(built).await {
            self.dispatch_direct(&message).await;
        }
    }

    async fn dispatch_direct(&self, message: &Message) -> bool {
        match self.router().route(message).await {
            Ok(_) => true,
            Err(RouteError::NotOnline(name)) => {
                self.notify(format!("User '{name}' is not online.")).await;
                false
            }
            Err(RouteError::Delivery { name, source }) => {
                debug!(from = self.name(), to = %name, error = %source, "direct delivery failed");
                self.notify(format!("Message to '{name}' could not be delivered.")).await;
                false
            }
            Err(error) => {
                warn!(name = self.name(), %error, "unroutable message");
                false
            }
        }
    }

    async fn list(&self) {
        let names = self.router().registry().snapshot_names().await;
        self.notify(format!(
            "Online users ({}): {}",
            names.len(),
            names.join(", ")
        ))
        .await;
    }

    async fn build(&self, built: Result<Message, MessageError>) -> Option<Message> {
        match built {
            Ok(message) => Some(message),
            Err(MessageError::TooLong { max, .. }) => {
                self.notify(format!("Message too long (max {max} characters).")).await;
                None
            }
            Err(error) => {
                warn!(name = self.name(), %error, "rejected message");
                None
            }
        }
    }

    fn is_self(&self, to: &str) -> bool {
        fold_name(to) == self.session.key()
    }

    fn record(&self, message: &Message) {
        if let Err(error) = self.ctx.history.append(message) {
            warn!(name = self.name(), %error, "message sent but not recorded");
        }
    }

    async fn notify(&self, text: impl Into<String>) {
        if let Err(error) = self.session.enqueue(ServerFrame::system(text)).await {
            debug!(name = self.name(), %error, "failed to queue notice");
        }
    }

    /// Leaves the registry (at most once across every close path), tells the
    /// others, and waits for queued frames to reach the socket.
    async fn close(&mut self) {
        self.transition(SessionState::Closing);
        self.session.close();

        let registry = self.router().registry();
        if registry.release(&self.session).await {
            let online = registry.count().await;
            info!(peer = ?self.peer, name = self.name(), online, "client left");
            self.announce(
                MessageKind::Leave,
                format!("{} has left the chat.", self.name()),
            )
            .await;
            self.router().sync_user_list().await;
        }

        let Some(mut writer_task) = self.writer.take() else {
            self.transition(SessionState::Closed);
            return;
        };
        match timeout(WRITER_FLUSH_TIMEOUT, &mut writer_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(error))) => debug!(name = self.name(), ?error, "writer failed"),
            Ok(Err(error)) => warn!(name = self.name(), ?error, "writer task panicked"),
            Err(_) => {
                debug!(name = self.name(), "writer did not flush in time");
                writer_task.abort();
            }
        }
        self.transition(SessionState::Closed);
    }
}

impl Drop for Connection {
    /// A connection task aborted mid-flight still stops its writer.
    fn drop(&mut self) {
        self.session.close();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

fn log_failures(report: &DeliveryReport) {
    for (name, error) in &report.failures {
        debug!(%name, %error, "destination skipped");
    }
}

/// Writes queued frames to the socket until the session closes, then flushes
/// whatever was already queued and shuts the write half down.
async fn drain_outbound<W>(
    mut writer: W,
    mut inbox: mpsc::Receiver<ServerFrame>,
    closer: CancellationToken,
    wire: WireFormat,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = select! {
            biased;
            frame = inbox.recv() => frame,
            _ = closer.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(error) = send_frame(&mut writer, &frame, wire).await {
            closer.cancel();
            return Err(error);
        }
    }

    while let Ok(frame) = inbox.try_recv() {
        send_frame(&mut writer, &frame, wire).await?;
    }
    writer.shutdown().await
}

async fn send_frame<W>(writer: &mut W, frame: &ServerFrame, wire: WireFormat) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line =
        encode_server(frame, wire).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_frame(writer, &line).await
}

async fn shutdown_writer<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shut down writer cleanly");
    }
}
