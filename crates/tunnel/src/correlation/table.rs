use crate::protocol::ProtocolError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Why a pending call resolved without a value.
#[derive(Error, Debug)]
pub enum CallFault {
    #[error("call timed out")]
    Timeout,

    #[error("call was cancelled")]
    Cancelled,

    #[error("reply stream is broken: {source}")]
    Protocol {
        #[from]
        source: ProtocolError,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("correlation id {correlation_id} is already pending")]
    Duplicate { correlation_id: String },
}

/// One outstanding call awaiting its correlated reply.
#[derive(Debug)]
pub struct PendingCall<T> {
    created_at: Instant,
    deadline: Instant,
    slot: oneshot::Sender<Result<T, CallFault>>,
}

impl<T> PendingCall<T> {
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn resolve(self, correlation_id: &str, result: Result<T, CallFault>) {
        if self.slot.send(result).is_err() {
            trace!(correlation_id, "waiter already gone");
        }
    }
}

/// Resolves once the call identified by [`Waiter::correlation_id`] completed, failed, timed out or was cancelled.
#[derive(Debug)]
pub struct Waiter<T> {
    correlation_id: String,
    rx: oneshot::Receiver<Result<T, CallFault>>,
}

impl<T> Waiter<T> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl<T> Future for Waiter<T> {
    type Output = Result<T, CallFault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a dropped slot means the table itself went away
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|result| result.unwrap_or(Err(CallFault::Cancelled)))
    }
}

/// Maps correlation ids to pending calls.
///
/// Every id is mutated under its own shard lock and no lock is held while a waiter runs.
#[derive(Debug)]
pub struct CorrelationTable<T> {
    pending: DashMap<String, PendingCall<T>>,
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self { pending: DashMap::new() }
    }

    /// Registers a call that fails with [`CallFault::Timeout`] once `deadline` passed and the table is swept.
    pub fn register<S: Into<String>>(&self, correlation_id: S, deadline: Instant) -> Result<Waiter<T>, CorrelationError> {
        let correlation_id = correlation_id.into();
        match self.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => Err(CorrelationError::Duplicate { correlation_id }),
            Entry::Vacant(entry) => {
                let (slot, rx) = oneshot::channel();
                entry.insert(PendingCall { created_at: Instant::now(), deadline, slot });
                trace!(correlation_id = %correlation_id, "registered pending call");
                Ok(Waiter { correlation_id, rx })
            }
        }
    }

    /// Resolves the call with its reply. Unknown ids are ignored, a late or redelivered reply is not an error.
    pub fn complete(&self, correlation_id: &str, value: T) -> bool {
        self.resolve(correlation_id, Ok(value))
    }

    pub fn fail(&self, correlation_id: &str, fault: CallFault) -> bool {
        self.resolve(correlation_id, Err(fault))
    }

    /// Releases the waiter immediately with [`CallFault::Cancelled`].
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.resolve(correlation_id, Err(CallFault::Cancelled))
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fails every call whose deadline is at or before `now`, returns how many expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();

        let mut count = 0;
        for correlation_id in expired {
            if let Some((_, call)) = self.pending.remove_if(&correlation_id, |_, call| call.deadline <= now) {
                warn!(
                    correlation_id = %correlation_id,
                    waited_ms = now.duration_since(call.created_at).as_millis(),
                    "pending call timed out"
                );
                call.resolve(&correlation_id, Err(CallFault::Timeout));
                count += 1;
            }
        }
        count
    }

    fn resolve(&self, correlation_id: &str, result: Result<T, CallFault>) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, call)) => {
                debug!(correlation_id, ok = result.is_ok(), "resolved pending call");
                call.resolve(correlation_id, result);
                true
            }
            None => {
                trace!(correlation_id, "no pending call, drop result");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn in_a_minute() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_complete() {
        let table = CorrelationTable::new();
        let waiter = table.register("a", in_a_minute()).unwrap();
        assert_eq!(waiter.correlation_id(), "a");

        assert!(table.complete("a", 42));
        assert_eq!(waiter.await.unwrap(), 42);
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_duplicate_registration() {
        let table = CorrelationTable::<()>::new();
        let _waiter = table.register("a", in_a_minute()).unwrap();
        assert_eq!(
            table.register("a", in_a_minute()).unwrap_err(),
            CorrelationError::Duplicate { correlation_id: "a".into() }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_late_completion_is_noop() {
        let table = CorrelationTable::new();
        assert!(!table.complete("nobody", 1));

        let waiter = table.register("a", in_a_minute()).unwrap();
        assert!(table.cancel("a"));
        assert!(matches!(waiter.await, Err(CallFault::Cancelled)));
        assert!(!table.complete("a", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_only_due_calls() {
        let table = CorrelationTable::<u8>::new();
        let soon = table.register("soon", Instant::now() + Duration::from_millis(100)).unwrap();
        let _later = table.register("later", Instant::now() + Duration::from_secs(10)).unwrap();

        assert_eq!(table.sweep(Instant::now()), 0);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(table.sweep(Instant::now()), 1);

        assert!(matches!(soon.await, Err(CallFault::Timeout)));
        assert!(table.contains("later"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_dropped_table_cancels() {
        let table = CorrelationTable::<u8>::new();
        let waiter = table.register("a", in_a_minute()).unwrap();
        drop(table);
        assert!(matches!(waiter.await, Err(CallFault::Cancelled)));
    }
}
