//! Splits a payload into a bounded, ordered chunk sequence.

use crate::codec::{Compression, chunk_frame_overhead};
use crate::config::TunnelConfig;
use crate::protocol::{ChunkedMessage, CodecError};
use bytes::Bytes;
use tracing::trace;

/// Payloads below this size are sent raw.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 1024;

/// Splits payloads against a maximum chunk size, compressing the whole payload first if configured.
#[derive(Debug, Clone)]
pub struct ChunkEncoder {
    max_chunk_size: usize,
    compression: Option<Compression>,
    compress_threshold: usize,
}

impl ChunkEncoder {
    /// Creates an encoder; a `max_chunk_size` of 0 is treated as 1.
    pub fn new(max_chunk_size: usize, compression: Option<Compression>) -> Self {
        Self { max_chunk_size: max_chunk_size.max(1), compression, compress_threshold: DEFAULT_COMPRESS_THRESHOLD }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(config.max_chunk_size(), config.compression()).with_compress_threshold(config.compress_threshold())
    }

    pub fn with_compress_threshold(mut self, compress_threshold: usize) -> Self {
        self.compress_threshold = compress_threshold;
        self
    }

    /// Shrinks the chunk size so a chunk frame for `correlation_id` fits in one transport message.
    pub fn fitted(&self, max_message_size: usize, correlation_id: &str) -> Self {
        let room = max_message_size.saturating_sub(chunk_frame_overhead(correlation_id.len()));
        Self { max_chunk_size: self.max_chunk_size.min(room).max(1), ..self.clone() }
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Encodes `payload` into chunks sharing `correlation_id`.
    ///
    /// The result is never empty: an empty payload yields one empty final chunk. Compression is kept only
    /// if it actually shrinks the payload.
    pub fn encode(&self, correlation_id: &str, payload: Bytes) -> Result<Vec<ChunkedMessage>, CodecError> {
        let total_length = payload.len() as u64;
        let (compression, body) = self.maybe_compress(payload)?;

        let chunk_count = body.len().div_ceil(self.max_chunk_size).max(1);
        let mut chunks = Vec::with_capacity(chunk_count);

        for index in 0..chunk_count {
            let start = index * self.max_chunk_size;
            let end = usize::min(start + self.max_chunk_size, body.len());
            chunks.push(ChunkedMessage {
                correlation_id: correlation_id.to_string(),
                sequence_number: sequence_number(index),
                is_last: index + 1 == chunk_count,
                payload: body.slice(start..end),
                total_length,
                compression,
            });
        }

        trace!(
            correlation_id,
            total_length,
            wire_length = body.len(),
            chunks = chunk_count,
            encoding = compression.map_or("identity", Compression::name),
            "encoded payload"
        );
        Ok(chunks)
    }

    fn maybe_compress(&self, payload: Bytes) -> Result<(Option<Compression>, Bytes), CodecError> {
        let Some(compression) = self.compression else {
            return Ok((None, payload));
        };

        if payload.len() < self.compress_threshold {
            return Ok((None, payload));
        }

        let compressed = compression.compress(&payload)?;
        if compressed.len() >= payload.len() {
            trace!(encoding = compression.name(), "compression did not shrink payload, sending raw");
            return Ok((None, payload));
        }
        Ok((Some(compression), compressed))
    }
}

#[allow(clippy::cast_possible_truncation, reason = "chunk counts are bounded by max_message_bytes")]
fn sequence_number(index: usize) -> u32 {
    index as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(len: usize) -> Bytes {
        let mut state: u32 = 0x9E37_79B9;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state.to_le_bytes()[0]
            })
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn test_chunks_are_bounded_and_ordered() {
        let encoder = ChunkEncoder::new(100, None);
        let chunks = encoder.encode("c-1", pseudo_random(1050)).unwrap();

        assert_eq!(chunks.len(), 11);
        for (index, chunk) in chunks.iter().enumerate() {
            assert!(chunk.payload.len() <= 100);
            assert_eq!(chunk.sequence_number as usize, index);
            assert_eq!(chunk.is_last, index == 10);
            assert_eq!(chunk.total_length, 1050);
            assert_eq!(chunk.correlation_id, "c-1");
        }
        assert_eq!(chunks[10].payload.len(), 50);
    }

    #[test]
    fn test_fitted_leaves_room_for_the_frame() {
        let encoder = ChunkEncoder::new(64 * 1024, None).fitted(1024, "c-1");
        assert_eq!(encoder.max_chunk_size(), 1024 - chunk_frame_overhead(3));

        let frame = crate::codec::FrameCodec::encode_frame(&encoder.encode("c-1", pseudo_random(5000)).unwrap()[0].clone().into()).unwrap();
        assert_eq!(frame.len(), 1024);
    }

    #[test]
    fn test_exact_multiple() {
        let chunks = ChunkEncoder::new(10, None).encode("c", pseudo_random(30)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.payload.len() == 10));
        assert!(chunks[2].is_last);
    }

    #[test]
    fn test_empty_payload_is_single_final_chunk() {
        let chunks = ChunkEncoder::new(10, Some(Compression::Gzip)).encode("c", Bytes::new()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last);
        assert!(chunks[0].payload.is_empty());
        assert_eq!(chunks[0].total_length, 0);
        assert!(!chunks[0].compressed());
    }

    #[test]
    fn test_compression_degenerates_to_single_chunk() {
        let payload = Bytes::from(vec![b'a'; 8 * 1024]);
        let chunks = ChunkEncoder::new(1024, Some(Compression::Gzip)).encode("c", payload).unwrap();

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last);
        assert!(chunks[0].compressed());
        assert_eq!(chunks[0].total_length, 8 * 1024);
    }

    #[test]
    fn test_small_or_incompressible_payload_is_raw() {
        let encoder = ChunkEncoder::new(1024, Some(Compression::Zstd));

        let chunks = encoder.encode("c", Bytes::from(vec![b'a'; 512])).unwrap();
        assert!(!chunks[0].compressed());

        let chunks = encoder.encode("c", pseudo_random(4096)).unwrap();
        assert!(chunks.iter().all(|c| !c.compressed()));
        assert_eq!(chunks.len(), 4);
    }
}
