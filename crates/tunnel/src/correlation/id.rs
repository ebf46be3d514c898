use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out correlation ids unique to this generator: a per-instance prefix plus a counter.
#[derive(Debug)]
pub struct CorrelationIds {
    prefix: String,
    next: AtomicU64,
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self::with_prefix(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn with_prefix<S: Into<String>>(prefix: S) -> Self {
        Self { prefix: prefix.into(), next: AtomicU64::new(0) }
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n:x}", self.prefix)
    }
}
