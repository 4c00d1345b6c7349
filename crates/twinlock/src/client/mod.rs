//! Lock client: one link manager, one handle per key, one heartbeat worker.

pub mod handle;
pub mod links;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use twinlock_proto::{decode_snapshot, Command, LockInfo, Message, RpcOutcome};

use crate::config::ClientConfig;
use crate::net::{self, AbortOnDrop};
use crate::resolver::Resolver;
use crate::LockError;

pub use handle::{HandleState, LockHandle, OwnerId};
pub use links::{LinkEvent, LinkManager, Slot};

/// Handles of one client, keyed by lock name.
#[derive(Default)]
pub struct HandleRegistry {
    handles: Mutex<HashMap<String, LockHandle>>,
}

impl HandleRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, LockHandle>> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_or_insert_with(&self, key: &str, make: impl FnOnce() -> LockHandle) -> LockHandle {
        self.lock().entry(key.to_string()).or_insert_with(make).clone()
    }

    pub fn handles(&self) -> Vec<LockHandle> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear_all(&self) -> usize {
        self.handles()
            .iter()
            .filter(|handle| handle.clear_on_abort())
            .count()
    }
}

pub struct LockClient {
    config: Arc<ClientConfig>,
    links: Arc<LinkManager>,
    registry: Arc<HandleRegistry>,
    runtime: Handle,
    shutdown: watch::Sender<bool>,
    _tasks: Vec<AbortOnDrop>,
}

impl LockClient {
    /// Resolve the server pair for `config.identity`, dial both servers and
    /// wait (bounded by `ready_timeout`) for the link manager to be ready.
    pub async fn connect(config: ClientConfig, resolver: &dyn Resolver) -> Result<Self, LockError> {
        if config.identity.is_empty() {
            return Err(LockError::invalid_state("client identity must not be empty"));
        }
        let endpoints = resolver
            .resolve(&config.identity)
            .await
            .map_err(|err| LockError::aborted(format!("resolving {}: {err:#}", config.identity)))?;
        net::ensure_private(endpoints.primary)?;
        net::ensure_private(endpoints.standby)?;

        let config = Arc::new(config);
        let links = LinkManager::new(config.as_ref().clone());
        let registry = Arc::new(HandleRegistry::default());
        let (shutdown, _) = watch::channel(false);
        let events = links.subscribe();
        links.run(endpoints);

        let tasks = vec![
            AbortOnDrop::new(spawn_heartbeat(
                registry.clone(),
                config.heartbeat_interval,
                shutdown.subscribe(),
            )),
            AbortOnDrop::new(spawn_abort_listener(registry.clone(), events, shutdown.subscribe())),
        ];

        if links.wait_ready(config.ready_timeout).await {
            tracing::info!(
                identity = %config.identity,
                primary = %endpoints.primary,
                standby = %endpoints.standby,
                preferred = ?links.preferred(),
                "lock client ready"
            );
        } else {
            tracing::warn!(identity = %config.identity, "lock servers not ready; continuing");
        }

        Ok(Self {
            config,
            links,
            registry,
            runtime: Handle::current(),
            shutdown,
            _tasks: tasks,
        })
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// The handle for `key`; every call with the same key returns the same
    /// handle.
    pub fn handle(&self, key: &str) -> LockHandle {
        self.registry.get_or_insert_with(key, || {
            LockHandle::new(key, self.links.clone(), self.config.clone(), self.runtime.clone())
        })
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn links(&self) -> &Arc<LinkManager> {
        &self.links
    }

    pub fn is_available(&self) -> bool {
        self.links.is_available()
    }

    /// Every key the active server knows about.
    pub async fn lock_infos(&self) -> Result<Vec<LockInfo>, LockError> {
        let request = Message::new(Command::GetAllInfo, self.links.next_sequence());
        match self.links.invoke(&request, Some(self.config.info_timeout)).await? {
            RpcOutcome::Reply { payload, .. } => Ok(decode_snapshot(payload)?),
            RpcOutcome::Timeout => Err(LockError::Timeout),
            RpcOutcome::Aborted => Err(LockError::aborted("lock table request aborted")),
        }
    }

    /// Close both links and stop the workers.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        self.links.close();
    }
}

impl Drop for LockClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_heartbeat(
    registry: Arc<HandleRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    for handle in registry.handles() {
                        handle.heartbeat();
                    }
                }
            }
        }
    })
}

fn spawn_abort_listener(
    registry: Arc<HandleRegistry>,
    mut events: broadcast::Receiver<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                event = events.recv() => match event {
                    Ok(LinkEvent::Aborted { slot, was_preferred: true }) => {
                        let cleared = registry.clear_all();
                        tracing::info!(?slot, cleared, "preferred link aborted");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        let cleared = registry.clear_all();
                        tracing::warn!(missed, cleared, "link events lagged; cleared ownership");
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    })
}
