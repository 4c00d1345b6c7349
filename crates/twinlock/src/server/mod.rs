//! Lock server: listener, per-connection sessions and the embedded handle.

pub mod engine;
pub mod replication;
pub mod retry;
pub mod table;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use twinlock_proto::{
    decode_message, spawn_sweeper, Command, Handshake, LinkMode, RpcTable, WireError,
};

use crate::config::ServerConfig;
use crate::net::{self, AbortOnDrop, FrameReader, Link, LinkState};
use crate::LockError;

pub use engine::{Engine, EnterRequest, Mirror, NoMirror, Requester, RetryStats};
pub use replication::StandbyLink;
pub use retry::{spawn_retry_worker, RetryQueue};
pub use table::{LockTable, LockerInfo, LockerTag};

struct Session {
    conn: u64,
    /// Set once the connection carries lock traffic. A client's idle standby
    /// link closing must not drain locks it holds through the other server.
    used: bool,
}

#[derive(Default)]
struct Sessions {
    by_identity: Mutex<HashMap<String, Session>>,
}

impl Sessions {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.by_identity.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self, identity: &str, conn: u64) {
        let mut sessions = self.lock();
        let used = sessions.get(identity).is_some_and(|old| old.used);
        if let Some(old) = sessions.insert(identity.to_string(), Session { conn, used }) {
            tracing::debug!(identity, old = old.conn, new = conn, "client session replaced");
        }
    }

    fn mark_used(&self, identity: &str, conn: u64) {
        if let Some(session) = self.lock().get_mut(identity) {
            if session.conn == conn {
                session.used = true;
            }
        }
    }

    /// Returns true when the identity's state should be aborted.
    fn close(&self, identity: &str, conn: u64) -> bool {
        let mut sessions = self.lock();
        match sessions.get(identity) {
            Some(session) if session.conn == conn => {
                let used = session.used;
                sessions.remove(identity);
                used
            }
            _ => false,
        }
    }
}

struct ServerContext {
    config: ServerConfig,
    engine: Arc<Engine>,
    sessions: Sessions,
    next_conn: AtomicU64,
}

/// A running server. Dropping the handle leaves the server running.
pub struct ServerHandle {
    local_addr: SocketAddr,
    engine: Arc<Engine>,
    standby: Option<Arc<StandbyLink>>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn table(&self) -> &Arc<LockTable> {
        self.engine.table()
    }

    /// State of the outbound peer link, if a peer is configured.
    pub fn replication_state(&self) -> Option<LinkState> {
        self.standby.as_ref().map(|standby| standby.state())
    }

    /// True when the peer link is streaming and the startup snapshot step has
    /// finished.
    pub fn replication_ready(&self) -> bool {
        self.standby
            .as_ref()
            .is_some_and(|standby| standby.state() == LinkState::Streaming && standby.snapshot_loaded())
    }

    /// Stop accepting, close every connection and wait for the server task.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(anyhow::anyhow!("server task failed: {err}")),
        }
    }

    /// Kill the server immediately, as if the process had died.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Bind the listener and run a server inside the current runtime.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<ServerHandle> {
    net::ensure_private(config.listen)?;
    if let Some(peer) = config.peer {
        net::ensure_private(peer)?;
    }
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let local_addr = listener.local_addr()?;

    let table = Arc::new(LockTable::new());
    let rpc = Arc::new(RpcTable::new());
    let standby = config
        .peer
        .map(|peer| Arc::new(StandbyLink::new(&config, peer, table.clone(), rpc.clone())));
    let mirror: Arc<dyn Mirror> = match &standby {
        Some(standby) => standby.clone(),
        None => Arc::new(NoMirror),
    };
    let engine = Arc::new(Engine::new(table, mirror, config.ack_threshold));

    tracing::info!(
        identity = %config.identity,
        listen = %local_addr,
        peer = ?config.peer,
        "twinlock server listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(ServerContext {
        config,
        engine: engine.clone(),
        sessions: Sessions::default(),
        next_conn: AtomicU64::new(1),
    });
    let task = tokio::spawn(run(listener, ctx, standby.clone(), rpc, shutdown_rx));

    Ok(ServerHandle {
        local_addr,
        engine,
        standby,
        shutdown_tx,
        task,
    })
}

async fn run(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    standby: Option<Arc<StandbyLink>>,
    rpc: Arc<RpcTable>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut workers = vec![
        AbortOnDrop::new(spawn_sweeper(rpc, ctx.config.sweep_interval, shutdown.clone())),
        AbortOnDrop::new(spawn_retry_worker(
            ctx.engine.clone(),
            ctx.config.retry_tick,
            shutdown.clone(),
        )),
    ];
    if let Some(standby) = standby {
        workers.push(AbortOnDrop::new(standby.spawn(shutdown.clone())));
    }
    let result = serve(listener, ctx, shutdown).await;
    drop(workers);
    result
}

async fn serve(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                if !net::is_private(peer.ip()) {
                    tracing::warn!(peer = %peer, "rejecting connection from non-private address");
                    continue;
                }
                if let Err(err) = socket.set_nodelay(true) {
                    tracing::debug!(peer = %peer, error = %err, "failed to disable nagle");
                }
                let ctx = ctx.clone();
                conns.spawn(async move {
                    match handle_connection(socket, peer, ctx).await {
                        Ok(()) => {}
                        Err(LockError::Protocol(err)) => {
                            tracing::warn!(peer = %peer, error = %err, "dropping connection after protocol error");
                        }
                        Err(err) => tracing::debug!(peer = %peer, error = %err, "connection closed"),
                    }
                });
            }
            Some(joined) = conns.join_next(), if !conns.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        tracing::error!(error = %err, "connection task panicked");
                    }
                }
            }
        }
    }
    conns.shutdown().await;
    tracing::info!("twinlock server stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<(), LockError> {
    let conn = ctx.next_conn.fetch_add(1, Ordering::Relaxed);
    let (link, mut reader, _writer) = net::open_link(stream, conn, peer, ctx.config.link_queue_capacity);

    let first = match tokio::time::timeout(ctx.config.handshake_timeout, reader.next()).await {
        Err(_) => return Err(LockError::Timeout),
        Ok(None) => return Ok(()),
        Ok(Some(frame)) => frame?,
    };
    let handshake = Handshake::decode(first)?;
    match handshake.mode {
        LinkMode::Client => serve_client(&ctx, link, reader, &handshake.identity, conn).await,
        LinkMode::Server => serve_peer(&ctx, link, reader, &handshake.identity).await,
    }
}

async fn serve_client(
    ctx: &ServerContext,
    link: Arc<Link>,
    mut reader: FrameReader,
    identity: &str,
    conn: u64,
) -> Result<(), LockError> {
    ctx.sessions.open(identity, conn);
    tracing::debug!(identity, peer = %link.peer(), conn, "client connected");
    let requester = Requester::new(identity, conn, link.clone());
    let result = client_loop(ctx, &link, &mut reader, &requester).await;
    if ctx.sessions.close(identity, conn) {
        ctx.engine.abort(identity);
    }
    tracing::debug!(identity, conn, "client disconnected");
    result
}

async fn client_loop(
    ctx: &ServerContext,
    link: &Link,
    reader: &mut FrameReader,
    requester: &Requester,
) -> Result<(), LockError> {
    let identity = requester.identity();
    while let Some(frame) = reader.next().await {
        let (message, _) = decode_message(frame?)?;
        match message.command {
            Command::Enter => {
                ctx.sessions.mark_used(identity, requester.conn());
                ctx.engine.submit_enter(EnterRequest::new(message, requester.clone()));
            }
            Command::Exit => {
                ctx.sessions.mark_used(identity, requester.conn());
                ctx.engine.exit(&message, requester);
            }
            Command::AckEnter | Command::AckExit => {
                ctx.sessions.mark_used(identity, requester.conn());
                ctx.engine.ack(identity, &message);
            }
            Command::GetAllInfo => {
                ctx.engine.answer_snapshot(&message, link)?;
            }
            Command::Heartbeat => {
                requester.reply(&message.reply(Command::Heartbeat));
            }
            Command::ForceFree | Command::Timeout | Command::Error => {
                return Err(LockError::Protocol(WireError::Malformed(
                    "unexpected command on client link",
                )));
            }
        }
    }
    Ok(())
}

async fn serve_peer(
    ctx: &ServerContext,
    link: Arc<Link>,
    mut reader: FrameReader,
    identity: &str,
) -> Result<(), LockError> {
    tracing::info!(peer_identity = identity, peer = %link.peer(), "peer server connected");
    while let Some(frame) = reader.next().await {
        let (message, _) = decode_message(frame?)?;
        match message.command {
            Command::Enter | Command::Exit | Command::ForceFree => {
                ctx.engine.apply_mirrored(&message);
            }
            Command::GetAllInfo => {
                ctx.engine.answer_snapshot(&message, &*link)?;
            }
            Command::Heartbeat => {
                link.send_message(&message.reply(Command::Heartbeat), None)?;
            }
            Command::AckEnter | Command::AckExit | Command::Timeout | Command::Error => {
                return Err(LockError::Protocol(WireError::Malformed(
                    "unexpected command on server link",
                )));
            }
        }
    }
    tracing::info!(peer_identity = identity, "peer server disconnected");
    Ok(())
}
