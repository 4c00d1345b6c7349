//! Request/reply correlation.
//!
//! Outgoing calls are parked in an [`RpcTable`] keyed by sequence number and
//! resolved exactly once, by whichever comes first:
//!
//! - the matching reply;
//! - the sweeper seeing the deadline pass;
//! - the link the call was sent on dying.
//!
//! Outcomes are delivered through oneshot channels after the table lock has
//! been released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::message::{encode_message, Message};
use crate::WireError;

/// Default sweep period for [`spawn_sweeper`].
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Identifier of one physical connection. A reconnect gets a fresh id.
pub type LinkId = u64;

/// How a call ended.
#[derive(Debug)]
pub enum RpcOutcome {
    Reply { message: Message, payload: Bytes },
    Timeout,
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("sequence {0} is already outstanding")]
    DuplicateSequence(i32),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Write side of a connection, as seen by the correlation layer.
pub trait FrameSink: Send + Sync {
    fn link_id(&self) -> LinkId;

    /// Queue one encoded message for transmission. Returns `false` when the
    /// connection is closed or cannot accept more data.
    fn send_payload(&self, payload: Bytes) -> bool;

    /// False once the connection behind this sink has gone away.
    fn is_open(&self) -> bool {
        true
    }
}

struct PendingCall {
    link: LinkId,
    started: Instant,
    timeout: Option<Duration>,
    tx: oneshot::Sender<RpcOutcome>,
}

impl PendingCall {
    fn expired(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => now.saturating_duration_since(self.started) > timeout,
            None => false,
        }
    }
}

/// Outstanding calls of one endpoint.
#[derive(Default)]
pub struct RpcTable {
    pending: Mutex<HashMap<i32, PendingCall>>,
}

impl RpcTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<i32, PendingCall>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Park a call. `timeout == None` means the sweeper never expires it.
    pub fn register(
        &self,
        sequence: i32,
        link: LinkId,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<RpcOutcome>, RpcError> {
        let (tx, rx) = oneshot::channel();
        let mut calls = self.calls();
        if calls.contains_key(&sequence) {
            tracing::error!(sequence, link, "duplicate rpc sequence registered");
            return Err(RpcError::DuplicateSequence(sequence));
        }
        calls.insert(
            sequence,
            PendingCall {
                link,
                started: Instant::now(),
                timeout,
                tx,
            },
        );
        Ok(rx)
    }

    /// Drop a call without firing it (used when the send itself failed).
    pub fn cancel(&self, sequence: i32) -> bool {
        self.calls().remove(&sequence).is_some()
    }

    /// Route a reply to its caller. Returns `false` for unknown sequences.
    pub fn complete(&self, message: Message, payload: Bytes) -> bool {
        let call = self.calls().remove(&message.sequence);
        match call {
            Some(call) => {
                let _ = call.tx.send(RpcOutcome::Reply { message, payload });
                true
            }
            None => {
                tracing::debug!(
                    sequence = message.sequence,
                    command = ?message.command,
                    "reply without pending call dropped"
                );
                false
            }
        }
    }

    /// Fire `Timeout` for every finite call older than its deadline.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<PendingCall> = {
            let mut calls = self.calls();
            let sequences: Vec<i32> = calls
                .iter()
                .filter(|(_, call)| call.expired(now))
                .map(|(seq, _)| *seq)
                .collect();
            sequences
                .into_iter()
                .filter_map(|seq| calls.remove(&seq))
                .collect()
        };
        let count = expired.len();
        for call in expired {
            let _ = call.tx.send(RpcOutcome::Timeout);
        }
        count
    }

    /// Fire `Aborted` for every call sent on `link`.
    pub fn abort_link(&self, link: LinkId) -> usize {
        let aborted: Vec<PendingCall> = {
            let mut calls = self.calls();
            let sequences: Vec<i32> = calls
                .iter()
                .filter(|(_, call)| call.link == link)
                .map(|(seq, _)| *seq)
                .collect();
            sequences
                .into_iter()
                .filter_map(|seq| calls.remove(&seq))
                .collect()
        };
        let count = aborted.len();
        for call in aborted {
            let _ = call.tx.send(RpcOutcome::Aborted);
        }
        if count > 0 {
            tracing::debug!(link, count, "aborted pending calls for dead link");
        }
        count
    }

    /// Fire `Aborted` for everything, used on shutdown.
    pub fn abort_all(&self) -> usize {
        let drained: Vec<PendingCall> = self.calls().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.tx.send(RpcOutcome::Aborted);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `message` on `sink` and wait for its outcome.
    ///
    /// The call is registered before the bytes are queued.
    pub async fn invoke(
        &self,
        sink: &dyn FrameSink,
        message: &Message,
        timeout: Option<Duration>,
    ) -> Result<RpcOutcome, RpcError> {
        let payload = encode_message(message, None)?;
        let rx = self.register(message.sequence, sink.link_id(), timeout)?;
        if !sink.send_payload(payload) {
            // The send never happened; the sweeper or an abort may already
            // have fired the call, in which case the receiver has the outcome.
            if self.cancel(message.sequence) {
                return Ok(RpcOutcome::Aborted);
            }
        }
        // A dropped sender means the table itself went away.
        Ok(rx.await.unwrap_or(RpcOutcome::Aborted))
    }
}

/// Encode and queue a message that expects no reply.
pub fn send_only(sink: &dyn FrameSink, message: &Message) -> Result<bool, RpcError> {
    let payload = encode_message(message, None)?;
    Ok(sink.send_payload(payload))
}

/// Run [`RpcTable::sweep`] every `interval` until `shutdown` flips to true.
pub fn spawn_sweeper(
    table: Arc<RpcTable>,
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
                    let fired = table.sweep(Instant::now());
                    if fired > 0 {
                        tracing::debug!(fired, "rpc sweeper timed out calls");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Command;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestSink {
        id: LinkId,
        open: AtomicBool,
        sent: Mutex<Vec<Bytes>>,
    }

    impl TestSink {
        fn new(id: LinkId) -> Self {
            Self {
                id,
                open: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl FrameSink for TestSink {
        fn link_id(&self) -> LinkId {
            self.id
        }

        fn send_payload(&self, payload: Bytes) -> bool {
            if !self.open.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().unwrap().push(payload);
            true
        }
    }

    fn reply_for(seq: i32) -> Message {
        Message::new(Command::Enter, seq)
    }

    #[tokio::test]
    async fn reply_fires_once_and_later_events_are_ignored() {
        let table = RpcTable::new();
        let rx = table.register(7, 1, Some(Duration::from_millis(10))).unwrap();
        assert!(table.complete(reply_for(7), Bytes::new()));
        assert!(!table.complete(reply_for(7), Bytes::new()));
        assert_eq!(table.sweep(Instant::now() + Duration::from_secs(1)), 0);
        assert_eq!(table.abort_link(1), 0);
        match rx.await.unwrap() {
            RpcOutcome::Reply { message, .. } => assert_eq!(message.sequence, 7),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_times_out_finite_calls_only() {
        let table = RpcTable::new();
        let finite = table.register(1, 1, Some(Duration::from_millis(50))).unwrap();
        let infinite = table.register(2, 1, None).unwrap();

        assert_eq!(table.sweep(Instant::now()), 0);
        assert_eq!(table.sweep(Instant::now() + Duration::from_secs(3600)), 1);
        assert!(matches!(finite.await.unwrap(), RpcOutcome::Timeout));
        assert_eq!(table.len(), 1);

        assert!(table.complete(reply_for(2), Bytes::new()));
        assert!(matches!(infinite.await.unwrap(), RpcOutcome::Reply { .. }));
    }

    #[tokio::test]
    async fn abort_link_only_hits_that_link() {
        let table = RpcTable::new();
        let on_dead = table.register(1, 10, None).unwrap();
        let on_live = table.register(2, 11, None).unwrap();
        assert_eq!(table.abort_link(10), 1);
        assert!(matches!(on_dead.await.unwrap(), RpcOutcome::Aborted));
        assert_eq!(table.len(), 1);
        table.abort_all();
        assert!(matches!(on_live.await.unwrap(), RpcOutcome::Aborted));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_sequence_is_rejected() {
        let table = RpcTable::new();
        let _rx = table.register(5, 1, None).unwrap();
        assert!(matches!(
            table.register(5, 2, None),
            Err(RpcError::DuplicateSequence(5))
        ));
    }

    #[tokio::test]
    async fn invoke_on_closed_sink_aborts_immediately() {
        let table = RpcTable::new();
        let sink = TestSink::new(3);
        sink.open.store(false, Ordering::SeqCst);
        let msg = Message::new(Command::Enter, 42).with_key("k");
        let outcome = table.invoke(&sink, &msg, None).await.unwrap();
        assert!(matches!(outcome, RpcOutcome::Aborted));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn invoke_resolves_with_reply_and_sweeper_times_out_the_rest() {
        let table = Arc::new(RpcTable::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = spawn_sweeper(table.clone(), Duration::from_millis(10), shutdown_rx);
        let sink = Arc::new(TestSink::new(1));

        let answered = {
            let table = table.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                let msg = Message::new(Command::Enter, 1);
                table.invoke(sink.as_ref(), &msg, None).await.unwrap()
            })
        };
        while table.len() < 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        table.complete(reply_for(1), Bytes::new());
        assert!(matches!(answered.await.unwrap(), RpcOutcome::Reply { .. }));

        let msg = Message::new(Command::Enter, 2);
        let outcome = table
            .invoke(sink.as_ref(), &msg, Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(matches!(outcome, RpcOutcome::Timeout));

        shutdown_tx.send(true).unwrap();
        sweeper.await.unwrap();
    }
}
