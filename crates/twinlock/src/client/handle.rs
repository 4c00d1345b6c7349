//! Per-key lock handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use twinlock_proto::{Command, Message, RpcOutcome, INFINITE_TIMEOUT};

use super::links::LinkManager;
use crate::config::ClientConfig;
use crate::LockError;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_OWNER: OwnerId = OwnerId::new();
}

/// Whoever holds a handle inside this process: a thread, a task, a request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    pub fn new() -> Self {
        OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    /// Stable id of the calling thread, used by the blocking API.
    pub fn current_thread() -> Self {
        THREAD_OWNER.with(|owner| *owner)
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Idle,
    Entering,
    Owned,
    Exiting,
}

struct Ownership {
    state: HandleState,
    owner: Option<OwnerId>,
    reentrancy: u32,
    /// Held while owned so local contenders queue on the gate.
    permit: Option<OwnedSemaphorePermit>,
}

struct HandleInner {
    key: String,
    links: Arc<LinkManager>,
    config: Arc<ClientConfig>,
    gate: Arc<Semaphore>,
    ownership: Mutex<Ownership>,
    runtime: Handle,
}

/// The client's view of one key. Cloning is cheap; every clone is the same
/// handle.
#[derive(Clone)]
pub struct LockHandle {
    inner: Arc<HandleInner>,
}

impl LockHandle {
    pub(crate) fn new(key: &str, links: Arc<LinkManager>, config: Arc<ClientConfig>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                key: key.to_string(),
                links,
                config,
                gate: Arc::new(Semaphore::new(1)),
                ownership: Mutex::new(Ownership {
                    state: HandleState::Idle,
                    owner: None,
                    reentrancy: 0,
                    permit: None,
                }),
                runtime,
            }),
        }
    }

    fn ownership(&self) -> MutexGuard<'_, Ownership> {
        self.inner.ownership.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn state(&self) -> HandleState {
        self.ownership().state
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.ownership().owner
    }

    pub fn reentrancy(&self) -> u32 {
        self.ownership().reentrancy
    }

    pub fn is_owned(&self) -> bool {
        self.state() == HandleState::Owned
    }

    /// Acquire the key for `owner`. `None` waits forever; finite timeouts
    /// below the configured minimum are rejected.
    pub async fn enter(&self, owner: OwnerId, timeout: Option<Duration>) -> Result<(), LockError> {
        if self.reenter(owner)? {
            return Ok(());
        }
        if let Some(timeout) = timeout {
            if timeout < self.inner.config.min_enter_timeout {
                return Err(LockError::invalid_state(format!(
                    "enter timeout {timeout:?} is below the {:?} minimum",
                    self.inner.config.min_enter_timeout
                )));
            }
        }
        // A deadline past what `Instant` can hold is no deadline at all.
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let permit = self.acquire_gate(deadline).await?;
        self.ownership().state = HandleState::Entering;

        match self.enter_remote(deadline).await {
            Ok(()) => {
                let mut ownership = self.ownership();
                ownership.state = HandleState::Owned;
                ownership.owner = Some(owner);
                ownership.reentrancy = 1;
                ownership.permit = Some(permit);
                tracing::debug!(key = %self.inner.key, ?owner, "lock acquired");
                Ok(())
            }
            Err(err) => {
                self.ownership().state = HandleState::Idle;
                drop(permit);
                Err(err)
            }
        }
    }

    fn reenter(&self, owner: OwnerId) -> Result<bool, LockError> {
        let mut ownership = self.ownership();
        if ownership.state != HandleState::Owned || ownership.owner != Some(owner) {
            return Ok(false);
        }
        if ownership.reentrancy >= self.inner.config.max_reentrancy {
            return Err(LockError::invalid_state(format!(
                "reentrancy limit {} reached on {}",
                self.inner.config.max_reentrancy, self.inner.key
            )));
        }
        ownership.reentrancy += 1;
        Ok(true)
    }

    async fn acquire_gate(&self, deadline: Option<Instant>) -> Result<OwnedSemaphorePermit, LockError> {
        let acquire = self.inner.gate.clone().acquire_owned();
        let permit = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.into(), acquire)
                .await
                .map_err(|_| LockError::Timeout)?,
            None => acquire.await,
        };
        permit.map_err(|_| LockError::aborted("lock handle closed"))
    }

    async fn enter_remote(&self, deadline: Option<Instant>) -> Result<(), LockError> {
        let inner = &self.inner;
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LockError::Timeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            let timeout_ms = remaining.map_or(INFINITE_TIMEOUT, |remaining| {
                i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX)
            });
            let request = Message::new(Command::Enter, inner.links.next_sequence())
                .with_key(inner.key.as_str())
                .with_identity(inner.config.identity.as_str())
                .with_timeout(timeout_ms);
            // The server's TIMEOUT should beat our own deadline.
            let rpc_timeout = remaining.map(|remaining| remaining + inner.config.rpc_grace);

            match inner.links.invoke(&request, rpc_timeout).await {
                Ok(RpcOutcome::Reply { message, .. }) => {
                    return match message.command {
                        Command::Enter => Ok(()),
                        Command::Timeout => Err(LockError::Timeout),
                        other => Err(LockError::invalid_state(format!(
                            "server answered enter on {} with {other:?}",
                            inner.key
                        ))),
                    };
                }
                Ok(RpcOutcome::Timeout) => return Err(LockError::Timeout),
                Ok(RpcOutcome::Aborted) | Err(LockError::Aborted(_)) => {
                    tracing::debug!(key = %inner.key, "enter aborted; retrying");
                }
                Err(err) => return Err(err),
            }

            let pause = Instant::now() + inner.config.enter_retry_backoff;
            tokio::time::sleep_until(deadline.map_or(pause, |deadline| pause.min(deadline)).into()).await;
            let grace = Instant::now() + inner.config.unavailable_grace;
            if !inner
                .links
                .wait_available(deadline.map_or(grace, |deadline| grace.min(deadline)))
                .await
            {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Err(LockError::Timeout);
                }
                return Err(LockError::aborted(format!("no lock server reachable for {}", inner.key)));
            }
        }
    }

    /// Release one level of ownership. The last level sends EXIT without
    /// waiting; if it never arrives the ack pipeline frees the key.
    pub fn exit(&self, owner: OwnerId) -> Result<(), LockError> {
        let Some(request) = self.begin_exit(owner)? else {
            return Ok(());
        };
        if let Err(err) = self.inner.links.send(&request) {
            tracing::debug!(key = %self.inner.key, error = %err, "exit not delivered");
        }
        self.finish_exit();
        Ok(())
    }

    /// Drop one reentrancy level; on the last one move to `Exiting` and hand
    /// back the EXIT to send. The gate stays closed until `finish_exit`.
    fn begin_exit(&self, owner: OwnerId) -> Result<Option<Message>, LockError> {
        let mut ownership = self.ownership();
        if ownership.state != HandleState::Owned || ownership.owner != Some(owner) {
            return Err(LockError::invalid_state(format!(
                "{owner:?} does not own {}",
                self.inner.key
            )));
        }
        ownership.reentrancy -= 1;
        if ownership.reentrancy > 0 {
            return Ok(None);
        }
        ownership.state = HandleState::Exiting;
        Ok(Some(
            Message::new(Command::Exit, self.inner.links.next_sequence())
                .with_key(self.inner.key.as_str())
                .with_identity(self.inner.config.identity.as_str()),
        ))
    }

    fn finish_exit(&self) {
        let permit = {
            let mut ownership = self.ownership();
            if ownership.state != HandleState::Exiting {
                return;
            }
            ownership.state = HandleState::Idle;
            ownership.owner = None;
            ownership.permit.take()
        };
        drop(permit);
    }

    /// Blocking acquire for synchronous callers, owned by the calling thread.
    ///
    /// Must not be called from inside an async task.
    pub fn try_enter(&self, timeout: Option<Duration>) -> Result<(), LockError> {
        let owner = OwnerId::current_thread();
        let handle = self.clone();
        let (tx, rx) = oneshot::channel();
        self.inner.runtime.spawn(async move {
            let _ = tx.send(handle.enter(owner, timeout).await);
        });
        rx.blocking_recv()
            .unwrap_or_else(|_| Err(LockError::aborted("client runtime stopped")))
    }

    /// Blocking counterpart of [`LockHandle::exit`] for the calling thread.
    pub fn release(&self) -> Result<(), LockError> {
        self.exit(OwnerId::current_thread())
    }

    pub(crate) fn heartbeat(&self) {
        let command = if self.is_owned() {
            Command::AckEnter
        } else {
            Command::AckExit
        };
        let message = Message::new(command, self.inner.links.next_sequence())
            .with_key(self.inner.key.as_str())
            .with_identity(self.inner.config.identity.as_str());
        if let Err(err) = self.inner.links.send(&message) {
            tracing::trace!(key = %self.inner.key, error = %err, "heartbeat dropped");
        }
    }

    /// Forget local ownership after the link carrying it died.
    pub(crate) fn clear_on_abort(&self) -> bool {
        let permit = {
            let mut ownership = self.ownership();
            if ownership.state != HandleState::Owned {
                return false;
            }
            ownership.state = HandleState::Idle;
            ownership.owner = None;
            ownership.reentrancy = 0;
            ownership.permit.take()
        };
        drop(permit);
        tracing::warn!(key = %self.inner.key, "link lost; local ownership cleared");
        true
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ownership = self.ownership();
        f.debug_struct("LockHandle")
            .field("key", &self.inner.key)
            .field("state", &ownership.state)
            .field("owner", &ownership.owner)
            .field("reentrancy", &ownership.reentrancy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_handle() -> LockHandle {
        let config = ClientConfig::new("tester");
        let links = LinkManager::new(config.clone());
        LockHandle::new("L1", links, Arc::new(config), Handle::current())
    }

    fn force_owned(handle: &LockHandle, owner: OwnerId) {
        let permit = handle.inner.gate.clone().try_acquire_owned().unwrap();
        let mut ownership = handle.ownership();
        ownership.state = HandleState::Owned;
        ownership.owner = Some(owner);
        ownership.reentrancy = 1;
        ownership.permit = Some(permit);
    }

    #[test]
    fn thread_owner_is_stable_per_thread() {
        let here = OwnerId::current_thread();
        assert_eq!(here, OwnerId::current_thread());
        let there = std::thread::spawn(OwnerId::current_thread).join().unwrap();
        assert_ne!(here, there);
        assert_ne!(OwnerId::new(), OwnerId::new());
    }

    #[tokio::test]
    async fn exit_without_enter_is_invalid() {
        let handle = idle_handle();
        assert!(matches!(
            handle.exit(OwnerId::new()),
            Err(LockError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn short_timeouts_are_rejected_before_any_io() {
        let handle = idle_handle();
        let result = handle
            .enter(OwnerId::new(), Some(Duration::from_millis(500)))
            .await;
        assert!(matches!(result, Err(LockError::InvalidState(_))));
        assert_eq!(handle.state(), HandleState::Idle);
    }

    #[tokio::test]
    async fn reentrancy_counts_up_and_down_without_round_trips() {
        let handle = idle_handle();
        let owner = OwnerId::new();
        force_owned(&handle, owner);

        for _ in 0..4 {
            handle.enter(owner, None).await.unwrap();
        }
        assert_eq!(handle.reentrancy(), 5);
        assert!(matches!(
            handle.exit(OwnerId::new()),
            Err(LockError::InvalidState(_))
        ));
        for _ in 0..5 {
            handle.exit(owner).unwrap();
        }
        assert_eq!(handle.state(), HandleState::Idle);
        assert_eq!(handle.owner(), None);
        assert!(matches!(handle.exit(owner), Err(LockError::InvalidState(_))));
        assert_eq!(handle.inner.gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn reentrancy_is_bounded() {
        let mut config = ClientConfig::new("tester");
        config.max_reentrancy = 2;
        let links = LinkManager::new(config.clone());
        let handle = LockHandle::new("L1", links, Arc::new(config), Handle::current());
        let owner = OwnerId::new();
        force_owned(&handle, owner);
        handle.enter(owner, None).await.unwrap();
        assert!(matches!(
            handle.enter(owner, None).await,
            Err(LockError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn local_contender_times_out_on_the_gate() {
        let handle = idle_handle();
        force_owned(&handle, OwnerId::new());
        let result = handle
            .enter(OwnerId::new(), Some(Duration::from_millis(1000)))
            .await;
        assert!(matches!(result, Err(LockError::Timeout)));
        assert!(handle.is_owned());
    }

    #[tokio::test]
    async fn unbounded_timeout_waits_like_no_timeout() {
        let handle = idle_handle();
        let holder = OwnerId::new();
        force_owned(&handle, holder);

        handle.enter(holder, Some(Duration::MAX)).await.unwrap();
        assert_eq!(handle.reentrancy(), 2);

        let contender = handle.enter(OwnerId::new(), Some(Duration::MAX));
        assert!(tokio::time::timeout(Duration::from_millis(200), contender)
            .await
            .is_err());
        assert_eq!(handle.owner(), Some(holder));
        assert_eq!(handle.state(), HandleState::Owned);
    }

    #[tokio::test]
    async fn last_exit_passes_through_exiting_with_the_gate_closed() {
        let handle = idle_handle();
        let owner = OwnerId::new();
        force_owned(&handle, owner);
        handle.enter(owner, None).await.unwrap();

        assert!(handle.begin_exit(owner).unwrap().is_none());
        assert_eq!(handle.state(), HandleState::Owned);

        let request = handle.begin_exit(owner).unwrap().expect("last level sends EXIT");
        assert_eq!(request.command, Command::Exit);
        assert_eq!(request.key.as_deref(), Some("L1"));
        assert_eq!(handle.state(), HandleState::Exiting);
        assert_eq!(handle.inner.gate.available_permits(), 0);
        assert!(matches!(handle.exit(owner), Err(LockError::InvalidState(_))));
        assert!(!handle.clear_on_abort());

        handle.finish_exit();
        assert_eq!(handle.state(), HandleState::Idle);
        assert_eq!(handle.owner(), None);
        assert_eq!(handle.inner.gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn abort_clears_ownership_and_opens_the_gate() {
        let handle = idle_handle();
        force_owned(&handle, OwnerId::new());
        assert!(handle.clear_on_abort());
        assert!(!handle.clear_on_abort());
        assert_eq!(handle.state(), HandleState::Idle);
        assert_eq!(handle.inner.gate.available_permits(), 1);
    }
}
