use crate::protocol::ChunkedMessage;

/// A single transport message exchanged between the two tunnel endpoints.
///
/// Every frame fits in one transport message; large payloads travel as a run of [`Frame::Chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A fragment of a request or response envelope
    Chunk(ChunkedMessage),
    /// A non-final chunk was accepted, the sender may continue
    Ack { correlation_id: String, sequence_number: u32 },
    /// Pull the reply chunk with the given sequence number
    Next { correlation_id: String, sequence_number: u32 },
    /// The sender abandoned the message, the receiver should drop its state
    Abort { correlation_id: String, reason: String },
}

impl Frame {
    pub fn ack<S: Into<String>>(correlation_id: S, sequence_number: u32) -> Self {
        Self::Ack { correlation_id: correlation_id.into(), sequence_number }
    }

    pub fn next<S: Into<String>>(correlation_id: S, sequence_number: u32) -> Self {
        Self::Next { correlation_id: correlation_id.into(), sequence_number }
    }

    pub fn abort<S: Into<String>, R: Into<String>>(correlation_id: S, reason: R) -> Self {
        Self::Abort { correlation_id: correlation_id.into(), reason: reason.into() }
    }

    /// Returns the correlation id this frame belongs to
    pub fn correlation_id(&self) -> &str {
        match self {
            Frame::Chunk(chunk) => &chunk.correlation_id,
            Frame::Ack { correlation_id, .. }
            | Frame::Next { correlation_id, .. }
            | Frame::Abort { correlation_id, .. } => correlation_id,
        }
    }

    /// Returns a short name of the frame kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Chunk(_) => "chunk",
            Frame::Ack { .. } => "ack",
            Frame::Next { .. } => "next",
            Frame::Abort { .. } => "abort",
        }
    }

    /// Converts the frame into a chunk if it contains one
    pub fn into_chunk(self) -> Option<ChunkedMessage> {
        match self {
            Frame::Chunk(chunk) => Some(chunk),
            _ => None,
        }
    }
}

impl From<ChunkedMessage> for Frame {
    fn from(chunk: ChunkedMessage) -> Self {
        Self::Chunk(chunk)
    }
}
