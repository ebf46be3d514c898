use crate::codec::Compression;
use bytes::Bytes;

/// One size-bounded fragment of a larger payload.
///
/// All chunks of one logical message share the same `correlation_id`, their sequence numbers form a
/// contiguous run starting at 0, and exactly the highest one carries `is_last`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedMessage {
    /// Opaque id, stable across all chunks of one logical message
    pub correlation_id: String,
    /// 0-based ordinal of this chunk
    pub sequence_number: u32,
    /// True for the final chunk of the message
    pub is_last: bool,
    /// The fragment itself, never longer than the sender's max chunk size
    pub payload: Bytes,
    /// Byte length of the reassembled payload after decompression
    pub total_length: u64,
    /// Compression applied to the whole payload before splitting
    pub compression: Option<Compression>,
}

impl ChunkedMessage {
    /// Returns true if the reassembled payload must be decompressed
    #[inline]
    pub fn compressed(&self) -> bool {
        self.compression.is_some()
    }

    /// Returns true if this chunk opens a message
    #[inline]
    pub fn is_first(&self) -> bool {
        self.sequence_number == 0
    }
}
