//! Request handling on top of the lock table.
//!
//! The engine grants, releases and force-releases keys, keeps the standby in
//! step through a [`Mirror`], parks blocked ENTERs in the retry queue and runs
//! the ack pipeline that frees keys a client no longer believes it holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use twinlock_proto::{
    encode_message, encode_snapshot, send_only, Command, FrameSink, Message, SequenceGenerator,
    WireError,
};

use super::retry::RetryQueue;
use super::table::LockTable;
use crate::LockError;

/// Forwards committed table changes to the peer server.
pub trait Mirror: Send + Sync {
    /// `Ok` when the change was queued or there is no connected peer to send
    /// it to. `Err` only when a connected peer link refused it.
    fn mirror(&self, message: &Message) -> Result<(), LockError>;

    /// False while the peer's table is being merged into ours; grants wait
    /// in the retry queue until it is done.
    fn accepting_grants(&self) -> bool {
        true
    }
}

/// Mirror for a server running without a peer.
pub struct NoMirror;

impl Mirror for NoMirror {
    fn mirror(&self, _message: &Message) -> Result<(), LockError> {
        Ok(())
    }
}

/// Reply path back to the client connection a request arrived on.
#[derive(Clone)]
pub struct Requester {
    identity: Arc<str>,
    conn: u64,
    sink: Arc<dyn FrameSink>,
}

impl Requester {
    pub fn new(identity: impl Into<Arc<str>>, conn: u64, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            identity: identity.into(),
            conn,
            sink,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn conn(&self) -> u64 {
        self.conn
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_open()
    }

    pub fn reply(&self, message: &Message) -> bool {
        match send_only(self.sink.as_ref(), message) {
            Ok(sent) => sent,
            Err(err) => {
                tracing::warn!(identity = %self.identity, error = %err, "failed to encode reply");
                false
            }
        }
    }
}

/// An ENTER waiting for a grant.
pub struct EnterRequest {
    pub message: Message,
    pub requester: Requester,
    pub received_at: Instant,
}

impl EnterRequest {
    pub fn new(message: Message, requester: Requester) -> Self {
        Self {
            message,
            requester,
            received_at: Instant::now(),
        }
    }

    pub fn identity(&self) -> &str {
        self.requester.identity()
    }

    pub fn key(&self) -> &str {
        self.message.key_str()
    }

    /// A negative timeout never expires.
    pub fn expired(&self, now: Instant) -> bool {
        match u64::try_from(self.message.timeout) {
            Ok(ms) => now.saturating_duration_since(self.received_at) > Duration::from_millis(ms),
            Err(_) => false,
        }
    }
}

/// Counters from one retry tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub granted: usize,
    pub timed_out: usize,
    pub dropped: usize,
    pub waiting: usize,
}

pub struct Engine {
    table: Arc<LockTable>,
    retry: RetryQueue,
    mirror: Arc<dyn Mirror>,
    acks: Mutex<HashMap<(String, String), u32>>,
    ack_threshold: u32,
    sequence: SequenceGenerator,
}

impl Engine {
    pub fn new(table: Arc<LockTable>, mirror: Arc<dyn Mirror>, ack_threshold: u32) -> Self {
        Self {
            table,
            retry: RetryQueue::new(),
            mirror,
            acks: Mutex::new(HashMap::new()),
            ack_threshold: ack_threshold.max(1),
            sequence: SequenceGenerator::new(),
        }
    }

    pub fn table(&self) -> &Arc<LockTable> {
        &self.table
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    fn acks(&self) -> MutexGuard<'_, HashMap<(String, String), u32>> {
        self.acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reset_ack(&self, identity: &str, key: &str) {
        self.acks().remove(&(identity.to_string(), key.to_string()));
    }

    fn mirror_change(&self, command: Command, key: &str, identity: &str) -> Result<(), LockError> {
        let message = Message::new(command, self.sequence.next())
            .with_key(key)
            .with_identity(identity);
        self.mirror.mirror(&message)
    }

    /// Entry point for an ENTER read off a client connection.
    pub fn submit_enter(&self, request: EnterRequest) {
        if self.retry.has_pending(request.identity()) {
            self.retry.add(request);
            return;
        }
        if self.try_grant(&request) {
            return;
        }
        if request.message.timeout == 0 {
            request.requester.reply(&request.message.reply(Command::Timeout));
            return;
        }
        tracing::debug!(
            key = request.key(),
            identity = request.identity(),
            timeout_ms = request.message.timeout,
            "enter queued"
        );
        self.retry.add(request);
    }

    /// Grant, mirror, then reply. A mirror failure undoes the grant.
    pub fn try_grant(&self, request: &EnterRequest) -> bool {
        let key = request.key();
        let identity = request.identity();
        if !request.requester.is_open() || !self.mirror.accepting_grants() {
            return false;
        }
        if !self.table.enter(key, identity) {
            return false;
        }
        if let Err(err) = self.mirror_change(Command::Enter, key, identity) {
            tracing::warn!(key, identity, error = %err, "mirror failed; rolling back grant");
            self.table.exit(key, identity);
            return false;
        }
        self.reset_ack(identity, key);
        if !request.requester.reply(&request.message.reply(Command::Enter)) {
            tracing::debug!(key, identity, "requester gone after grant; releasing");
            self.release(key, identity);
        }
        true
    }

    /// Release `key` for the requester. Always answers: EXIT on success,
    /// ERROR when the requester did not hold it.
    pub fn exit(&self, message: &Message, requester: &Requester) -> bool {
        let key = message.key_str();
        let identity = requester.identity();
        let released = self.release(key, identity);
        let command = if released { Command::Exit } else { Command::Error };
        requester.reply(&message.reply(command));
        released
    }

    fn release(&self, key: &str, identity: &str) -> bool {
        if !self.table.exit(key, identity) {
            return false;
        }
        self.reset_ack(identity, key);
        if let Err(err) = self.mirror_change(Command::Exit, key, identity) {
            tracing::warn!(key, identity, error = %err, "failed to mirror exit");
        }
        true
    }

    /// Forget everything `identity` holds or waits for. Returns freed keys.
    pub fn abort(&self, identity: &str) -> Vec<String> {
        let dropped = self.retry.remove(identity).len();
        let freed = self.table.exit_all(identity);
        for key in &freed {
            if let Err(err) = self.mirror_change(Command::ForceFree, key, identity) {
                tracing::warn!(key = %key, identity, error = %err, "failed to mirror forced release");
            }
        }
        self.acks().retain(|(owner, _), _| owner != identity);
        if dropped > 0 || !freed.is_empty() {
            tracing::info!(identity, freed = freed.len(), dropped, "identity aborted");
        }
        freed
    }

    /// Feed one heartbeat into the ack pipeline. Returns true when it forced
    /// the key free.
    pub fn ack(&self, identity: &str, message: &Message) -> bool {
        let key = message.key_str();
        match message.command {
            Command::AckEnter => {
                self.reset_ack(identity, key);
                false
            }
            Command::AckExit => {
                if self.table.owner_of(key).as_deref() != Some(identity) {
                    self.reset_ack(identity, key);
                    return false;
                }
                let count = {
                    let mut acks = self.acks();
                    let count = acks.entry((identity.to_string(), key.to_string())).or_insert(0);
                    *count += 1;
                    *count
                };
                if count < self.ack_threshold {
                    return false;
                }
                self.reset_ack(identity, key);
                if !self.table.exit(key, identity) {
                    return false;
                }
                tracing::warn!(key, identity, count, "owner reports not holding key; forcing release");
                if let Err(err) = self.mirror_change(Command::ForceFree, key, identity) {
                    tracing::warn!(key, identity, error = %err, "failed to mirror forced release");
                }
                true
            }
            _ => false,
        }
    }

    /// Apply a change mirrored by the peer. Never mirrored back.
    pub fn apply_mirrored(&self, message: &Message) -> bool {
        let key = message.key_str();
        let identity = message.identity_str();
        match message.command {
            Command::Enter => {
                let adopted = self.table.adopt(key, identity);
                if !adopted && self.table.owner_of(key).as_deref() != Some(identity) {
                    tracing::warn!(key, identity, "peer granted a key held here; kept local owner");
                }
                adopted
            }
            Command::Exit => self.table.exit(key, identity),
            Command::ForceFree => self.table.force_exit_held_by(key, identity),
            other => {
                tracing::debug!(command = ?other, "ignoring non-mirror command on server link");
                false
            }
        }
    }

    /// Encoded GET_ALL_INFO reply for `request`.
    pub fn snapshot_reply(&self, request: &Message) -> Result<Bytes, WireError> {
        let snapshot = encode_snapshot(&self.table.snapshot())?;
        encode_message(&request.reply(Command::GetAllInfo), Some(&snapshot))
    }

    /// Queue the GET_ALL_INFO reply on `sink`. False when the link refused it;
    /// the requester then sees its own timeout or abort.
    pub fn answer_snapshot(&self, request: &Message, sink: &dyn FrameSink) -> Result<bool, WireError> {
        let sent = sink.send_payload(self.snapshot_reply(request)?);
        if !sent {
            tracing::warn!(
                link = sink.link_id(),
                sequence = request.sequence,
                "snapshot reply dropped; link closed or queue full"
            );
        }
        Ok(sent)
    }

    /// One pass of the retry worker over every identity's head request.
    pub fn process_retries(&self, now: Instant) -> RetryStats {
        let mut stats = RetryStats::default();
        let waiting = self.retry.visit_heads(|request| {
            if !request.requester.is_open() {
                stats.dropped += 1;
                return true;
            }
            if request.expired(now) {
                request.requester.reply(&request.message.reply(Command::Timeout));
                stats.timed_out += 1;
                return true;
            }
            if self.try_grant(request) {
                stats.granted += 1;
                return true;
            }
            false
        });
        stats.waiting = waiting;
        stats
    }
}
