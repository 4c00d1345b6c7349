//! Dual-link manager.
//!
//! A client keeps one connection to each server of its pair. Each slot is
//! driven by its own supervisor task through `Connecting -> Handshaking ->
//! Streaming -> Closing` and back, and all traffic goes to whichever slot is
//! currently preferred.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use twinlock_proto::{
    send_only, spawn_sweeper, FrameSink, Handshake, LinkId, LinkMode, Message, RpcOutcome,
    RpcTable, SequenceGenerator,
};

use crate::config::ClientConfig;
use crate::net::{self, AbortOnDrop, Link, LinkState};
use crate::resolver::Endpoints;
use crate::LockError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    Primary,
    Standby,
}

impl Slot {
    fn index(self) -> usize {
        match self {
            Slot::Primary => 0,
            Slot::Standby => 1,
        }
    }

    fn other(self) -> Slot {
        match self {
            Slot::Primary => Slot::Standby,
            Slot::Standby => Slot::Primary,
        }
    }
}

/// Published on every link transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Connected(Slot),
    /// `was_preferred` tells whether lock traffic was riding on the link.
    Aborted { slot: Slot, was_preferred: bool },
    /// No link is up.
    Unavailable,
}

struct SlotState {
    state: LinkState,
    link: Option<Arc<Link>>,
}

struct Shared {
    slots: [SlotState; 2],
    preferred: Option<Slot>,
    /// Start of the current affinity window; reset when every link is down.
    first_attempt: Option<Instant>,
}

pub struct LinkManager {
    config: ClientConfig,
    rpc: Arc<RpcTable>,
    sequence: SequenceGenerator,
    shared: Mutex<Shared>,
    next_link_id: AtomicU64,
    events: broadcast::Sender<LinkEvent>,
    changed: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<AbortOnDrop>>,
}

impl LinkManager {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (changed, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            rpc: Arc::new(RpcTable::new()),
            sequence: SequenceGenerator::new(),
            shared: Mutex::new(Shared {
                slots: [
                    SlotState {
                        state: LinkState::Closing,
                        link: None,
                    },
                    SlotState {
                        state: LinkState::Closing,
                        link: None,
                    },
                ],
                preferred: None,
                first_attempt: None,
            }),
            next_link_id: AtomicU64::new(1),
            events,
            changed,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<AbortOnDrop>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version += 1);
    }

    /// Start both slot supervisors and the RPC sweeper.
    pub fn run(self: &Arc<Self>, endpoints: Endpoints) {
        let mut tasks = self.tasks();
        tasks.push(AbortOnDrop::new(spawn_sweeper(
            self.rpc.clone(),
            self.config.sweep_interval,
            self.shutdown.subscribe(),
        )));
        for (slot, addr) in [(Slot::Primary, endpoints.primary), (Slot::Standby, endpoints.standby)] {
            let this = self.clone();
            let shutdown = self.shutdown.subscribe();
            tasks.push(AbortOnDrop::new(tokio::spawn(async move {
                this.supervise(slot, addr, shutdown).await;
            })));
        }
    }

    async fn supervise(&self, slot: Slot, addr: SocketAddr, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.connect_once(slot, addr) => {}
                _ = shutdown.changed() => break,
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.set_state(slot, LinkState::Closing);
    }

    fn set_state(&self, slot: Slot, state: LinkState) {
        self.shared().slots[slot.index()].state = state;
    }

    async fn connect_once(&self, slot: Slot, addr: SocketAddr) {
        {
            let mut shared = self.shared();
            shared.slots[slot.index()].state = LinkState::Connecting;
            shared.first_attempt.get_or_insert_with(Instant::now);
        }
        let stream = match net::connect(addr).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(?slot, addr = %addr, error = %err, "connect failed");
                self.set_state(slot, LinkState::Closing);
                return;
            }
        };

        self.set_state(slot, LinkState::Handshaking);
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (link, mut reader, _writer) = net::open_link(stream, id, addr, self.config.link_queue_capacity);
        let handshake = Handshake::new(LinkMode::Client, self.config.identity.clone());
        if !link.send_payload(handshake.encode()) {
            self.set_state(slot, LinkState::Closing);
            return;
        }

        self.on_connected(slot, link);
        let result = net::read_replies(&mut reader, &self.rpc).await;
        match &result {
            Ok(()) => tracing::info!(?slot, addr = %addr, link = id, "link closed by server"),
            Err(err) => tracing::warn!(?slot, addr = %addr, link = id, error = %err, "link failed"),
        }
        self.on_aborted(slot, id);
    }

    fn on_connected(&self, slot: Slot, link: Arc<Link>) {
        let id = link.id();
        let preferred = {
            let mut shared = self.shared();
            let window_open = shared
                .first_attempt
                .is_some_and(|start| start.elapsed() <= self.config.preferred_window);
            let entry = &mut shared.slots[slot.index()];
            entry.state = LinkState::Streaming;
            entry.link = Some(link);
            match shared.preferred {
                None => shared.preferred = Some(slot),
                Some(current) if current != slot && slot == Slot::Primary && window_open => {
                    shared.preferred = Some(Slot::Primary);
                }
                Some(_) => {}
            }
            shared.preferred
        };
        tracing::info!(?slot, link = id, ?preferred, "link up");
        let _ = self.events.send(LinkEvent::Connected(slot));
        self.notify();
    }

    fn on_aborted(&self, slot: Slot, id: LinkId) {
        let (was_preferred, preferred) = {
            let mut shared = self.shared();
            let entry = &mut shared.slots[slot.index()];
            entry.state = LinkState::Closing;
            entry.link = None;
            let was_preferred = shared.preferred == Some(slot);
            if was_preferred {
                let other = slot.other();
                shared.preferred = shared.slots[other.index()].link.as_ref().map(|_| other);
            }
            if shared.preferred.is_none() {
                shared.first_attempt = None;
            }
            (was_preferred, shared.preferred)
        };
        let aborted = self.rpc.abort_link(id);
        if was_preferred {
            tracing::warn!(?slot, link = id, aborted, failover = ?preferred, "preferred link lost");
        }
        let _ = self.events.send(LinkEvent::Aborted { slot, was_preferred });
        if preferred.is_none() {
            let _ = self.events.send(LinkEvent::Unavailable);
        }
        self.notify();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn preferred(&self) -> Option<Slot> {
        self.shared().preferred
    }

    pub fn state(&self, slot: Slot) -> LinkState {
        self.shared().slots[slot.index()].state
    }

    pub fn is_available(&self) -> bool {
        self.preferred().is_some()
    }

    /// Both links up, or one up and the affinity window over.
    pub fn is_ready(&self) -> bool {
        let shared = self.shared();
        let up = shared.slots.iter().filter(|slot| slot.link.is_some()).count();
        match up {
            2 => true,
            1 => shared
                .first_attempt
                .is_some_and(|start| start.elapsed() >= self.config.preferred_window),
            _ => false,
        }
    }

    async fn wait_until(&self, deadline: Instant, check: impl Fn(&Self) -> bool) -> bool {
        let mut changed = self.changed.subscribe();
        loop {
            if check(self) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Readiness can flip on elapsed time alone, so never sleep long.
            let nap = (deadline - now).min(Duration::from_millis(25));
            let _ = tokio::time::timeout(nap, changed.changed()).await;
        }
    }

    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout, Self::is_ready).await
    }

    pub async fn wait_available(&self, deadline: Instant) -> bool {
        self.wait_until(deadline, Self::is_available).await
    }

    fn preferred_link(&self) -> Option<Arc<Link>> {
        let shared = self.shared();
        let slot = shared.preferred?;
        shared.slots[slot.index()].link.clone()
    }

    pub fn next_sequence(&self) -> i32 {
        self.sequence.next()
    }

    /// Fire-and-forget on the preferred link.
    pub fn send(&self, message: &Message) -> Result<(), LockError> {
        let link = self
            .preferred_link()
            .ok_or_else(|| LockError::aborted("no link available"))?;
        if send_only(link.as_ref(), message)? {
            Ok(())
        } else {
            Err(LockError::aborted(format!("link {} rejected send", link.id())))
        }
    }

    /// Call on the preferred link and wait for the outcome.
    pub async fn invoke(&self, message: &Message, timeout: Option<Duration>) -> Result<RpcOutcome, LockError> {
        let link = self
            .preferred_link()
            .ok_or_else(|| LockError::aborted("no link available"))?;
        Ok(self.rpc.invoke(link.as_ref(), message, timeout).await?)
    }

    /// Stop the supervisors and fail every outstanding call.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<AbortOnDrop> = self.tasks().drain(..).collect();
        drop(tasks);
        {
            let mut shared = self.shared();
            for slot in shared.slots.iter_mut() {
                slot.state = LinkState::Closing;
                slot.link = None;
            }
            shared.preferred = None;
        }
        self.rpc.abort_all();
        self.notify();
    }
}
