//! Outbound link to the peer server.
//!
//! Committed changes are mirrored over it fire-and-forget. Every time the link
//! comes up this side pulls the peer's table, merges it into its own and
//! pushes its own holds back as mirrored ENTERs, so grants mirrored into a
//! dead link are recovered on both sides. Local grants wait until the merge
//! is done.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use twinlock_proto::{
    decode_snapshot, send_only, Command, FrameSink, Handshake, LinkMode, Message, RpcOutcome,
    RpcTable, SequenceGenerator,
};

use super::engine::Mirror;
use super::table::LockTable;
use crate::config::ServerConfig;
use crate::net::{self, Link, LinkState};
use crate::LockError;

struct LinkSlot {
    state: LinkState,
    link: Option<Arc<Link>>,
}

pub struct StandbyLink {
    identity: String,
    peer: SocketAddr,
    config: ServerConfig,
    table: Arc<LockTable>,
    rpc: Arc<RpcTable>,
    sequence: SequenceGenerator,
    slot: Mutex<LinkSlot>,
    next_link_id: AtomicU64,
    snapshot_loaded: AtomicBool,
}

impl StandbyLink {
    pub fn new(config: &ServerConfig, peer: SocketAddr, table: Arc<LockTable>, rpc: Arc<RpcTable>) -> Self {
        Self {
            identity: config.identity.clone(),
            peer,
            config: config.clone(),
            table,
            rpc,
            sequence: SequenceGenerator::new(),
            slot: Mutex::new(LinkSlot {
                state: LinkState::Connecting,
                link: None,
            }),
            next_link_id: AtomicU64::new(1),
            snapshot_loaded: AtomicBool::new(false),
        }
    }

    fn slot(&self) -> MutexGuard<'_, LinkSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: LinkState) {
        self.slot().state = state;
    }

    pub fn state(&self) -> LinkState {
        self.slot().state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True once the peer's table has been merged over the current link.
    pub fn snapshot_loaded(&self) -> bool {
        self.snapshot_loaded.load(Ordering::Acquire)
    }

    /// Keep the link up until `shutdown` flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = self.connect_once() => {}
                    _ = shutdown.changed() => break,
                }
                self.close_current();
                tokio::select! {
                    _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
                    _ = shutdown.changed() => break,
                }
            }
            self.close_current();
        })
    }

    async fn connect_once(&self) {
        self.set_state(LinkState::Connecting);
        let stream = match net::connect(self.peer).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(peer = %self.peer, error = %err, "peer connect failed");
                return;
            }
        };

        self.set_state(LinkState::Handshaking);
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (link, mut reader, _writer) =
            net::open_link(stream, id, self.peer, self.config.link_queue_capacity);
        if !link.send_payload(Handshake::new(LinkMode::Server, self.identity.clone()).encode()) {
            return;
        }
        {
            let mut slot = self.slot();
            slot.link = Some(link.clone());
            self.snapshot_loaded.store(false, Ordering::Release);
        }
        tracing::info!(peer = %self.peer, link = id, "peer link up; merging peer table");

        let result = tokio::select! {
            res = net::read_replies(&mut reader, &self.rpc) => res,
            res = self.drive(link.as_ref()) => res,
        };
        match result {
            Ok(()) => tracing::info!(peer = %self.peer, link = id, "peer link closed"),
            Err(err) => tracing::warn!(peer = %self.peer, link = id, error = %err, "peer link lost"),
        }
    }

    /// Merge the peer's table, then keep the link alive.
    async fn drive(&self, link: &Link) -> Result<(), LockError> {
        self.load_snapshot(link).await?;
        self.set_state(LinkState::Streaming);
        let mut ticker = tokio::time::interval(self.config.replication_heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let ping = Message::new(Command::Heartbeat, self.sequence.next());
            match self.call(link, &ping, self.config.replication_heartbeat * 2).await? {
                RpcOutcome::Reply { .. } => {}
                RpcOutcome::Timeout => return Err(LockError::Timeout),
                RpcOutcome::Aborted => return Err(LockError::aborted("peer heartbeat aborted")),
            }
        }
    }

    async fn call(&self, link: &Link, message: &Message, timeout: Duration) -> Result<RpcOutcome, LockError> {
        Ok(self.rpc.invoke(link, message, Some(timeout)).await?)
    }

    async fn load_snapshot(&self, link: &Link) -> Result<(), LockError> {
        let request = Message::new(Command::GetAllInfo, self.sequence.next());
        let payload = match self.call(link, &request, self.config.snapshot_timeout).await? {
            RpcOutcome::Reply { payload, .. } => payload,
            RpcOutcome::Timeout => return Err(LockError::Timeout),
            RpcOutcome::Aborted => return Err(LockError::aborted("snapshot request aborted")),
        };
        let rows = decode_snapshot(payload)?;
        let changed = self.table.load_all_info(&rows);
        self.snapshot_loaded.store(true, Ordering::Release);
        let pushed = self.push_holds(link).await?;
        tracing::info!(peer = %self.peer, rows = rows.len(), changed, pushed, "merged peer snapshot");
        Ok(())
    }

    /// Send every hold in our table to the peer, which settles conflicts the
    /// same way `load_all_info` does here.
    async fn push_holds(&self, link: &Link) -> Result<usize, LockError> {
        let mut pushed = 0;
        for row in self.table.snapshot() {
            let (false, Some(identity)) = (row.available, row.identity.as_deref()) else {
                continue;
            };
            let enter = Message::new(Command::Enter, self.sequence.next())
                .with_key(row.key.as_str())
                .with_identity(identity);
            if !link.send_message_waiting(&enter).await? {
                return Err(LockError::aborted(format!("peer link {} closed during push", link.id())));
            }
            pushed += 1;
        }
        Ok(pushed)
    }

    fn close_current(&self) {
        let link = {
            let mut slot = self.slot();
            slot.state = LinkState::Closing;
            self.snapshot_loaded.store(false, Ordering::Release);
            slot.link.take()
        };
        if let Some(link) = link {
            let aborted = self.rpc.abort_link(link.id());
            tracing::debug!(peer = %self.peer, link = link.id(), aborted, "peer link torn down");
        }
    }
}

impl Mirror for StandbyLink {
    fn mirror(&self, message: &Message) -> Result<(), LockError> {
        let link = self.slot().link.clone();
        let Some(link) = link else {
            return Ok(());
        };
        if send_only(link.as_ref(), message)? {
            Ok(())
        } else {
            Err(LockError::aborted(format!("peer link {} refused mirror", link.id())))
        }
    }

    /// With no peer link there is nothing to merge; with one, grants resume
    /// once its snapshot is in.
    fn accepting_grants(&self) -> bool {
        let slot = self.slot();
        slot.link.is_none() || self.snapshot_loaded()
    }
}
