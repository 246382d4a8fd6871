use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinHandle, JoinSet},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    connection::{ConnectionContext, handle_connection},
    history::{HistoryStore, MemoryHistory},
    protocol::ServerFrame,
    registry::Registry,
    router::Router,
};

pub const SHUTDOWN_NOTICE: &str = "Server is shutting down. Goodbye!";

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let history = Arc::new(MemoryHistory::new(config.history_capacity));
        Self::with_history(listener, config, history)
    }

    /// Builds a server that records messages into a caller-supplied store.
    pub fn with_history(
        listener: TcpListener,
        config: ServerConfig,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let ctx = ConnectionContext {
            config,
            router: Router::new(Registry::new()),
            history,
            shutdown: CancellationToken::new(),
        };
        Self {
            listener,
            ctx: Arc::new(ctx),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Registry {
        self.ctx.router.registry().clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, ctx } = self;
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&ctx).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &ctx, &mut connections);
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = ?err, "connection task panicked");
                    }
                }
            }
        }

        drop(listener);
        wait_for_connections(connections, ctx.config.shutdown_grace).await;
        info!("server stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// Runs the server on its own task and returns a handle to stop it.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let registry = self.registry();
        let token = CancellationToken::new();
        let stop = token.clone();
        let task = tokio::spawn(async move { self.run_until(stop.cancelled_owned()).await });
        Ok(ServerHandle {
            addr,
            registry,
            token,
            task,
        })
    }
}

/// Binds `127.0.0.1:<port>` with default settings and starts serving.
pub async fn start(port: u16) -> Result<ServerHandle> {
    Server::bind(ServerConfig::with_port(port)).await?.spawn()
}

pub struct ServerHandle {
    addr: SocketAddr,
    registry: Registry,
    token: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Asks the server to stop. Calling it again has no further effect.
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        self.task.await.context("server task panicked")?
    }
}

async fn handle_shutdown(ctx: &ConnectionContext) {
    info!("server shutting down");
    ctx.shutdown.cancel();
    ctx.router.broadcast(ServerFrame::system(SHUTDOWN_NOTICE)).await;

    let sessions = ctx.router.registry().drain().await;
    info!(count = sessions.len(), "disconnecting clients");
    for session in sessions {
        session.close();
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    ctx: &Arc<ConnectionContext>,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, ctx, connections),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &Arc<ConnectionContext>,
    connections: &mut JoinSet<()>,
) {
    debug!(%peer, "accepted connection");
    let ctx = Arc::clone(ctx);
    connections.spawn(async move {
        if let Err(err) = handle_connection(stream, ctx).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

async fn wait_for_connections(mut connections: JoinSet<()>, grace: Duration) {
    let drain = async { while connections.join_next().await.is_some() {} };
    if timeout(grace, drain).await.is_err() {
        warn!(
            remaining = connections.len(),
            "connections did not finish in time, aborting"
        );
        connections.abort_all();
    }
}
