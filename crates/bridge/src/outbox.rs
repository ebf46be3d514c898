use dashmap::DashMap;
use micro_tunnel::protocol::ChunkedMessage;
use micro_tunnel::sweep::Sweep;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Reply chunks of completed calls, kept so the caller can pull them and re-pull after a lost answer.
///
/// A reply stays until the caller aborts, or until it sat idle for longer than the idle timeout. At most
/// `capacity` replies are kept; stashing one more evicts the reply idle the longest.
#[derive(Debug)]
pub struct ReplyOutbox {
    pending: DashMap<String, Stash>,
    idle_timeout: Duration,
    capacity: usize,
}

#[derive(Debug)]
struct Stash {
    chunks: Vec<ChunkedMessage>,
    last_activity: Instant,
}

impl ReplyOutbox {
    pub fn new(idle_timeout: Duration, capacity: usize) -> Self {
        Self { pending: DashMap::new(), idle_timeout, capacity: capacity.max(1) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stashes every chunk of a reply, indexed by sequence number.
    pub fn stash(&self, correlation_id: String, chunks: Vec<ChunkedMessage>) {
        trace!(correlation_id = %correlation_id, chunks = chunks.len(), "stash reply");
        while self.pending.len() >= self.capacity && !self.pending.contains_key(&correlation_id) {
            if !self.evict_stalest() {
                break;
            }
        }
        self.pending.insert(correlation_id, Stash { chunks, last_activity: Instant::now() });
    }

    fn evict_stalest(&self) -> bool {
        let stalest = self
            .pending
            .iter()
            .min_by_key(|stash| stash.value().last_activity)
            .map(|stash| stash.key().clone());

        match stalest {
            Some(correlation_id) => {
                warn!(correlation_id = %correlation_id, capacity = self.capacity, "outbox full, evict stalest reply");
                self.pending.remove(&correlation_id).is_some()
            }
            None => false,
        }
    }

    /// Serves chunk `sequence_number`; any chunk may be served again until the reply is removed.
    pub fn pull(&self, correlation_id: &str, sequence_number: u32) -> Option<ChunkedMessage> {
        let mut stash = self.pending.get_mut(correlation_id)?;
        stash.last_activity = Instant::now();
        stash.chunks.get(usize::try_from(sequence_number).ok()?).cloned()
    }

    pub fn remove(&self, correlation_id: &str) -> bool {
        self.pending.remove(correlation_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Sweep for ReplyOutbox {
    fn sweep(&self, now: Instant) -> usize {
        let Some(horizon) = now.checked_sub(self.idle_timeout) else {
            return 0;
        };

        let mut evicted = 0;
        self.pending.retain(|correlation_id, stash| {
            let keep = stash.last_activity > horizon;
            if !keep {
                trace!(correlation_id = %correlation_id, "evict idle reply");
                evicted += 1;
            }
            keep
        });
        evicted
    }
}
