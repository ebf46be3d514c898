//! Background expiry of pending calls and stale buffers.
//!
//! The sweep runs on a fixed interval, independent of call volume. A timeout is reported at the first
//! tick at or after the deadline, so the interval bounds how late a timeout can fire.

use crate::codec::Reassembler;
use crate::correlation::CorrelationTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Anything holding state that expires with time.
pub trait Sweep: Send + Sync {
    /// Expires whatever is due at `now`, returns the number of expired entries.
    fn sweep(&self, now: Instant) -> usize;
}

impl<T: Send> Sweep for CorrelationTable<T> {
    fn sweep(&self, now: Instant) -> usize {
        CorrelationTable::sweep(self, now)
    }
}

impl Sweep for Reassembler {
    fn sweep(&self, now: Instant) -> usize {
        self.evict_idle(now)
    }
}

/// Spawns a task sweeping `targets` every `interval` until `shutdown` is cancelled.
pub fn spawn_sweeper(targets: Vec<Arc<dyn Sweep>>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("sweeper stopped");
                    return;
                }
                now = ticker.tick() => {
                    let expired: usize = targets.iter().map(|target| target.sweep(now)).sum();
                    if expired > 0 {
                        trace!(expired, "sweep expired entries");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CallFault;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_within_one_interval() {
        let sweep_interval = Duration::from_millis(10);
        let table = Arc::new(CorrelationTable::<()>::new());
        let shutdown = CancellationToken::new();
        let sweeper = spawn_sweeper(vec![Arc::clone(&table) as Arc<dyn Sweep>], sweep_interval, shutdown.clone());

        let start = Instant::now();
        let waiter = table.register("a", start + Duration::from_millis(100)).unwrap();

        assert!(matches!(waiter.await, Err(CallFault::Timeout)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "fired early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(100) + sweep_interval, "fired late: {elapsed:?}");

        shutdown.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reassembly_is_evicted() {
        use crate::codec::{ChunkEncoder, ReassemblyLimits};

        let limits = ReassemblyLimits { idle_timeout: Duration::from_millis(500), ..ReassemblyLimits::default() };
        let reassembler = Arc::new(Reassembler::new(limits));
        let shutdown = CancellationToken::new();
        let _sweeper = spawn_sweeper(vec![Arc::clone(&reassembler) as Arc<dyn Sweep>], Duration::from_millis(50), shutdown.clone());

        let chunks = ChunkEncoder::new(10, None).encode("a", vec![0u8; 30].into()).unwrap();
        reassembler.feed(chunks[0].clone()).unwrap();
        assert_eq!(reassembler.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(reassembler.in_flight(), 0);
        shutdown.cancel();
    }
}
