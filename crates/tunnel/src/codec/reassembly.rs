//! Receiver side of the chunk codec.
//!
//! A [`ReassemblyBuffer`] accumulates the chunks of one correlation id. The [`Reassembler`] owns all
//! in-flight buffers of an endpoint, bounds them, and evicts the ones that went idle.

use crate::codec::Compression;
use crate::config::TunnelConfig;
use crate::ensure;
use crate::protocol::{ChunkedMessage, ProtocolError};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Outcome of applying one chunk to a buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Progress {
    /// The chunk was appended, more are expected
    Pending,
    /// The chunk was already applied and has been ignored
    Duplicate,
    /// The final chunk was appended
    Complete,
}

/// Accumulates the chunks of one logical message, strictly in sequence order.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    correlation_id: String,
    segments: Vec<Bytes>,
    next_sequence: u32,
    received_bytes: usize,
    total_length: u64,
    compression: Option<Compression>,
    max_bytes: usize,
    complete: bool,
    last_activity: Instant,
}

impl ReassemblyBuffer {
    /// Opens a buffer for the message `first` belongs to, `first` itself is not applied yet.
    pub fn new(first: &ChunkedMessage, max_bytes: usize) -> Self {
        Self {
            correlation_id: first.correlation_id.clone(),
            segments: Vec::new(),
            next_sequence: 0,
            received_bytes: 0,
            total_length: first.total_length,
            compression: first.compression,
            max_bytes,
            complete: false,
            last_activity: Instant::now(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The sequence number the buffer accepts next
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    pub fn received_bytes(&self) -> usize {
        self.received_bytes
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Applies one chunk.
    ///
    /// Already applied sequence numbers are ignored so transport redelivery is harmless; anything ahead
    /// of the next expected sequence is a [`ProtocolError::SequenceViolation`].
    pub fn apply(&mut self, chunk: ChunkedMessage) -> Result<Progress, ProtocolError> {
        let expected = self.next_sequence();
        if chunk.sequence_number < expected {
            trace!(correlation_id = %self.correlation_id, sequence = chunk.sequence_number, "ignore duplicate chunk");
            return Ok(Progress::Duplicate);
        }

        ensure!(
            !self.complete && chunk.sequence_number == expected,
            ProtocolError::sequence_violation(&self.correlation_id, expected, chunk.sequence_number)
        );
        ensure!(
            chunk.correlation_id == self.correlation_id,
            ProtocolError::inconsistent_chunk(&self.correlation_id, format!("foreign chunk of {}", chunk.correlation_id))
        );
        ensure!(
            chunk.total_length == self.total_length,
            ProtocolError::length_mismatch(&self.correlation_id, self.total_length, chunk.total_length)
        );
        ensure!(
            chunk.compression == self.compression,
            ProtocolError::inconsistent_chunk(&self.correlation_id, "compression changed mid-message")
        );
        ensure!(
            self.received_bytes + chunk.payload.len() <= self.max_bytes,
            ProtocolError::message_too_large(&self.correlation_id, self.max_bytes)
        );

        self.received_bytes += chunk.payload.len();
        self.segments.push(chunk.payload);
        self.next_sequence = self.next_sequence.saturating_add(1);
        self.last_activity = Instant::now();

        if chunk.is_last {
            self.complete = true;
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Pending)
        }
    }

    /// Joins the segments of a complete buffer and removes the compression.
    pub fn finish(self) -> Result<Bytes, ProtocolError> {
        ensure!(
            self.complete,
            ProtocolError::inconsistent_chunk(&self.correlation_id, "message finished before its last chunk")
        );

        let joined = if self.segments.len() == 1 {
            self.segments.into_iter().next().unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(self.received_bytes);
            for segment in &self.segments {
                buf.extend_from_slice(segment);
            }
            buf.freeze()
        };

        let payload = match self.compression {
            Some(compression) => compression.decompress(&joined, self.total_length)?,
            None => joined,
        };

        ensure!(
            payload.len() as u64 == self.total_length,
            ProtocolError::length_mismatch(&self.correlation_id, self.total_length, payload.len() as u64)
        );
        Ok(payload)
    }

    /// Applies `chunk` and returns the full payload once the last chunk arrived.
    pub fn decode(&mut self, chunk: ChunkedMessage) -> Result<Option<Bytes>, ProtocolError> {
        match self.apply(chunk)? {
            Progress::Complete => {
                let done = ReassemblyBuffer {
                    correlation_id: self.correlation_id.clone(),
                    segments: std::mem::take(&mut self.segments),
                    next_sequence: self.next_sequence,
                    received_bytes: self.received_bytes,
                    total_length: self.total_length,
                    compression: self.compression,
                    max_bytes: self.max_bytes,
                    complete: true,
                    last_activity: self.last_activity,
                };
                done.finish().map(Some)
            }
            Progress::Pending | Progress::Duplicate => Ok(None),
        }
    }
}

/// Bounds of a [`Reassembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// Maximum number of concurrently open buffers
    pub max_in_flight: usize,
    /// Maximum bytes of one message, compressed on the wire and decompressed after reassembly
    pub max_message_bytes: usize,
    /// Buffers and tombstones idle for longer than this are evicted
    pub idle_timeout: Duration,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self { max_in_flight: 1024, max_message_bytes: 64 * 1024 * 1024, idle_timeout: Duration::from_secs(60) }
    }
}

impl From<&TunnelConfig> for ReassemblyLimits {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight(),
            max_message_bytes: config.max_message_bytes(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// All in-flight reassemblies of one endpoint, keyed by correlation id.
///
/// Each correlation id is mutated under its own shard lock; decompression of a finished message runs
/// after the buffer left the map. Ids that completed or were abandoned are remembered until they go
/// idle, so late redeliveries are dropped instead of opening a new message.
#[derive(Debug)]
pub struct Reassembler {
    buffers: DashMap<String, ReassemblyBuffer>,
    closed: DashMap<String, Instant>,
    in_flight: AtomicUsize,
    limits: ReassemblyLimits,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(ReassemblyLimits::default())
    }
}

impl Reassembler {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self { buffers: DashMap::new(), closed: DashMap::new(), in_flight: AtomicUsize::new(0), limits }
    }

    pub fn limits(&self) -> &ReassemblyLimits {
        &self.limits
    }

    /// Number of messages currently being reassembled
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Returns true if a message with this id completed or was abandoned recently
    pub fn is_closed(&self, correlation_id: &str) -> bool {
        self.closed.contains_key(correlation_id)
    }

    /// Feeds one chunk; returns the payload once its message is complete.
    ///
    /// Any error drops the buffer of that correlation id.
    pub fn feed(&self, chunk: ChunkedMessage) -> Result<Option<Bytes>, ProtocolError> {
        if self.is_closed(&chunk.correlation_id) {
            trace!(
                correlation_id = %chunk.correlation_id,
                sequence = chunk.sequence_number,
                "drop chunk of closed message"
            );
            return Ok(None);
        }

        let correlation_id = chunk.correlation_id.clone();
        let finished = match self.buffers.entry(correlation_id.clone()) {
            Entry::Vacant(entry) => {
                ensure!(chunk.is_first(), ProtocolError::unknown_correlation(&correlation_id, chunk.sequence_number));
                ensure!(
                    usize::try_from(chunk.total_length).is_ok_and(|len| len <= self.limits.max_message_bytes),
                    ProtocolError::message_too_large(&correlation_id, self.limits.max_message_bytes)
                );

                let mut buffer = ReassemblyBuffer::new(&chunk, self.limits.max_message_bytes);
                match buffer.apply(chunk)? {
                    Progress::Complete => Some(buffer),
                    Progress::Pending | Progress::Duplicate => {
                        self.reserve_slot()?;
                        entry.insert(buffer);
                        None
                    }
                }
            }
            Entry::Occupied(mut entry) => match entry.get_mut().apply(chunk) {
                Ok(Progress::Complete) => {
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    Some(entry.remove())
                }
                Ok(Progress::Pending | Progress::Duplicate) => None,
                Err(e) => {
                    entry.remove();
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    self.closed.insert(correlation_id.clone(), Instant::now());
                    warn!(correlation_id = %correlation_id, cause = %e, "drop faulted reassembly");
                    return Err(e);
                }
            },
        };

        let Some(buffer) = finished else {
            return Ok(None);
        };

        self.closed.insert(correlation_id.clone(), Instant::now());
        let payload = buffer.finish()?;
        debug!(correlation_id = %correlation_id, len = payload.len(), "reassembled message");
        Ok(Some(payload))
    }

    fn reserve_slot(&self) -> Result<(), ProtocolError> {
        let max_in_flight = self.limits.max_in_flight;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max_in_flight).then_some(n + 1))
            .map(drop)
            .map_err(|_current| ProtocolError::TooManyInFlight { max_in_flight })
    }

    /// Drops any partial state of `correlation_id`; later chunks of it are ignored.
    pub fn abandon(&self, correlation_id: &str) {
        if self.buffers.remove(correlation_id).is_some() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            debug!(correlation_id, "abandoned reassembly");
        }
        self.closed.insert(correlation_id.to_string(), Instant::now());
    }

    /// Evicts buffers and tombstones idle since before `now - idle_timeout`, returns the evicted buffer count.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let Some(horizon) = now.checked_sub(self.limits.idle_timeout) else {
            return 0;
        };

        let mut evicted = 0;
        self.buffers.retain(|correlation_id, buffer| {
            let keep = buffer.last_activity() > horizon;
            if !keep {
                warn!(correlation_id = %correlation_id, received = buffer.received_bytes(), "evict stale reassembly");
                evicted += 1;
            }
            keep
        });
        if evicted > 0 {
            self.in_flight.fetch_sub(evicted, Ordering::AcqRel);
        }
        self.closed.retain(|_, closed_at| *closed_at > horizon);
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChunkEncoder;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    fn chunks(id: &str, len: usize, max: usize) -> Vec<ChunkedMessage> {
        ChunkEncoder::new(max, None).encode(id, payload(len)).unwrap()
    }

    #[test]
    fn test_round_trip_all_sizes() {
        for compression in [None, Some(Compression::Gzip), Some(Compression::Br)] {
            let encoder = ChunkEncoder::new(64, compression).with_compress_threshold(0);
            for len in [0, 1, 63, 64, 65, 1000, 4096] {
                let data = payload(len);
                let reassembler = Reassembler::default();
                let mut result = None;
                for chunk in encoder.encode("id", data.clone()).unwrap() {
                    assert!(chunk.payload.len() <= 64);
                    result = reassembler.feed(chunk).unwrap();
                }
                assert_eq!(result.as_ref(), Some(&data), "len {len} with {compression:?}");
                assert_eq!(reassembler.in_flight(), 0);
            }
        }
    }

    #[test]
    fn test_buffer_decode() {
        let all = chunks("a", 250, 100);
        let mut buffer = ReassemblyBuffer::new(&all[0], usize::MAX);

        assert_eq!(buffer.decode(all[0].clone()).unwrap(), None);
        assert_eq!(buffer.decode(all[1].clone()).unwrap(), None);
        assert_eq!(buffer.decode(all[2].clone()).unwrap(), Some(payload(250)));
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let all = chunks("a", 250, 100);
        let mut buffer = ReassemblyBuffer::new(&all[0], usize::MAX);
        buffer.apply(all[0].clone()).unwrap();
        buffer.apply(all[1].clone()).unwrap();

        let (received, next) = (buffer.received_bytes(), buffer.next_sequence());
        assert_eq!(buffer.apply(all[0].clone()).unwrap(), Progress::Duplicate);
        assert_eq!(buffer.apply(all[1].clone()).unwrap(), Progress::Duplicate);
        assert_eq!((buffer.received_bytes(), buffer.next_sequence()), (received, next));
        assert!(!buffer.is_complete());
    }

    #[test]
    fn test_replay_after_completion_is_ignored() {
        let all = chunks("a", 250, 100);
        let mut buffer = ReassemblyBuffer::new(&all[0], usize::MAX);
        for chunk in &all {
            buffer.decode(chunk.clone()).unwrap();
        }

        for chunk in &all {
            assert_eq!(buffer.decode(chunk.clone()).unwrap(), None);
        }
        assert_eq!(buffer.next_sequence(), 3);
        assert!(buffer.is_complete());
    }

    #[test]
    fn test_gap_is_sequence_violation() {
        let all = chunks("a", 250, 100);
        let mut buffer = ReassemblyBuffer::new(&all[0], usize::MAX);
        buffer.apply(all[0].clone()).unwrap();

        let err = buffer.apply(all[2].clone()).unwrap_err();
        assert!(matches!(err, ProtocolError::SequenceViolation { expected: 1, actual: 2, .. }));
        assert!(!buffer.is_complete());
    }

    #[test]
    fn test_reassembler_drops_faulted_buffer() {
        let all = chunks("a", 250, 100);
        let reassembler = Reassembler::default();
        reassembler.feed(all[0].clone()).unwrap();
        assert_eq!(reassembler.in_flight(), 1);

        assert!(matches!(reassembler.feed(all[2].clone()), Err(ProtocolError::SequenceViolation { .. })));
        assert_eq!(reassembler.in_flight(), 0);

        // the faulted stream is closed, its stragglers are dropped
        assert!(reassembler.is_closed("a"));
        assert!(reassembler.feed(all[1].clone()).unwrap().is_none());
    }

    #[test]
    fn test_unknown_correlation() {
        let all = chunks("a", 250, 100);
        let err = Reassembler::default().feed(all[1].clone()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCorrelation { sequence: 1, .. }));
    }

    #[test]
    fn test_length_mismatch() {
        let mut all = chunks("a", 150, 100);
        for chunk in &mut all {
            chunk.total_length = 200;
        }
        let reassembler = Reassembler::default();
        reassembler.feed(all[0].clone()).unwrap();
        let err = reassembler.feed(all[1].clone()).unwrap_err();
        assert!(matches!(err, ProtocolError::LengthMismatch { expected: 200, actual: 150, .. }));
    }

    #[test]
    fn test_redelivery_after_completion_is_dropped() {
        let all = chunks("a", 50, 100);
        let reassembler = Reassembler::default();
        assert!(reassembler.feed(all[0].clone()).unwrap().is_some());
        assert!(reassembler.feed(all[0].clone()).unwrap().is_none());
        assert!(reassembler.is_closed("a"));
    }

    #[test]
    fn test_limits() {
        let limits = ReassemblyLimits { max_in_flight: 1, max_message_bytes: 1000, idle_timeout: Duration::from_secs(1) };
        let reassembler = Reassembler::new(limits);

        reassembler.feed(chunks("a", 250, 100)[0].clone()).unwrap();
        let err = reassembler.feed(chunks("b", 250, 100)[0].clone()).unwrap_err();
        assert!(matches!(err, ProtocolError::TooManyInFlight { max_in_flight: 1 }));

        let err = reassembler.feed(chunks("c", 2000, 100)[0].clone()).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { max_bytes: 1000, .. }));
    }

    #[test]
    fn test_in_flight_limit_holds_across_threads() {
        let limits = ReassemblyLimits { max_in_flight: 4, ..ReassemblyLimits::default() };
        let reassembler = Reassembler::new(limits);
        let firsts = (0..64).map(|n| chunks(&format!("m{n}"), 250, 100).swap_remove(0)).collect::<Vec<_>>();

        let accepted = std::thread::scope(|scope| {
            let workers = firsts
                .chunks(8)
                .map(|batch| {
                    let reassembler = &reassembler;
                    scope.spawn(move || batch.iter().filter(|chunk| reassembler.feed((*chunk).clone()).is_ok()).count())
                })
                .collect::<Vec<_>>();
            workers.into_iter().map(|worker| worker.join().unwrap()).sum::<usize>()
        });

        assert_eq!(accepted, 4);
        assert_eq!(reassembler.in_flight(), 4);

        for n in 0..64 {
            reassembler.abandon(&format!("m{n}"));
        }
        assert_eq!(reassembler.in_flight(), 0);
        assert!(reassembler.feed(chunks("late", 250, 100)[0].clone()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_and_evict() {
        let limits = ReassemblyLimits { idle_timeout: Duration::from_secs(5), ..ReassemblyLimits::default() };
        let reassembler = Reassembler::new(limits);

        let a = chunks("a", 250, 100);
        reassembler.feed(a[0].clone()).unwrap();
        reassembler.abandon("a");
        assert_eq!(reassembler.in_flight(), 0);
        assert!(reassembler.feed(a[1].clone()).unwrap().is_none());

        reassembler.feed(chunks("b", 250, 100)[0].clone()).unwrap();
        assert_eq!(reassembler.evict_idle(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(reassembler.evict_idle(Instant::now()), 1);
        assert_eq!(reassembler.in_flight(), 0);
        assert!(!reassembler.is_closed("a"));
    }
}
