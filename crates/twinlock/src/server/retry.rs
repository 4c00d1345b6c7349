use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::engine::{Engine, EnterRequest};

/// Blocked ENTER requests, one FIFO per identity.
#[derive(Default)]
pub struct RetryQueue {
    queues: Mutex<HashMap<String, VecDeque<EnterRequest>>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, VecDeque<EnterRequest>>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append behind whatever the identity already has queued.
    pub fn add(&self, request: EnterRequest) {
        let identity = request.identity().to_string();
        self.queues().entry(identity).or_default().push_back(request);
    }

    /// Put `request` at `position` in its identity's queue (clamped to the end).
    pub fn insert(&self, position: usize, request: EnterRequest) {
        let identity = request.identity().to_string();
        let mut queues = self.queues();
        let queue = queues.entry(identity).or_default();
        let position = position.min(queue.len());
        queue.insert(position, request);
    }

    /// Drop every request queued for `identity`.
    pub fn remove(&self, identity: &str) -> Vec<EnterRequest> {
        self.queues()
            .remove(identity)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn has_pending(&self, identity: &str) -> bool {
        self.queues().get(identity).is_some_and(|queue| !queue.is_empty())
    }

    pub fn pending_for(&self, identity: &str) -> usize {
        self.queues().get(identity).map_or(0, VecDeque::len)
    }

    pub fn len(&self) -> usize {
        self.queues().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer the head of every identity's queue to `attempt`; heads it
    /// resolves are popped, the rest stay in front. Runs under the queue lock
    /// so an `add` racing with the tick lands behind the head. Returns how many
    /// requests are still waiting.
    pub(crate) fn visit_heads(&self, mut attempt: impl FnMut(&EnterRequest) -> bool) -> usize {
        let mut queues = self.queues();
        for queue in queues.values_mut() {
            if queue.front().is_some_and(&mut attempt) {
                queue.pop_front();
            }
        }
        queues.retain(|_, queue| !queue.is_empty());
        queues.values().map(VecDeque::len).sum()
    }
}

/// Run [`Engine::process_retries`] every `tick` until shutdown.
pub fn spawn_retry_worker(
    engine: Arc<Engine>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let stats = engine.process_retries(Instant::now());
                    if stats.granted + stats.timed_out + stats.dropped > 0 {
                        tracing::debug!(
                            granted = stats.granted,
                            timed_out = stats.timed_out,
                            dropped = stats.dropped,
                            waiting = stats.waiting,
                            "retry tick"
                        );
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::engine::test_support::{enter_request, RecordingSink};

    #[test]
    fn fifo_per_identity_and_insert_at_front() {
        let queue = RetryQueue::new();
        let sink = Arc::new(RecordingSink::default());
        queue.add(enter_request(1, "k1", "A", 5_000, &sink));
        queue.add(enter_request(2, "k2", "A", 5_000, &sink));
        queue.add(enter_request(3, "k1", "B", 5_000, &sink));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pending_for("A"), 2);

        let mut seen = Vec::new();
        let waiting = queue.visit_heads(|request| {
            seen.push(request.message.sequence);
            request.identity() == "B"
        });
        seen.sort();
        assert_eq!(seen, vec![1, 3]);
        assert_eq!(waiting, 2);
        assert!(!queue.has_pending("B"));

        queue.insert(0, enter_request(0, "k0", "A", 5_000, &sink));
        queue.add(enter_request(4, "k3", "A", 5_000, &sink));
        let order: Vec<i32> = queue
            .remove("A")
            .iter()
            .map(|request| request.message.sequence)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 4]);
        assert!(queue.is_empty());
    }
}
