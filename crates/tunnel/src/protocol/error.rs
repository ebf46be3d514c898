use std::io;
use thiserror::Error;

/// Failures of one logical chunk stream.
///
/// A `ProtocolError` is always fatal to the message identified by its correlation id and never to the
/// process: the offending reassembly is dropped and the peer receives a structured answer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown correlation id {correlation_id}, sequence {sequence} does not start a message")]
    UnknownCorrelation { correlation_id: String, sequence: u32 },

    #[error("sequence violation for {correlation_id}: expected {expected}, got {actual}")]
    SequenceViolation { correlation_id: String, expected: u32, actual: u32 },

    #[error("length mismatch for {correlation_id}: declared {expected} bytes, reassembled {actual}")]
    LengthMismatch { correlation_id: String, expected: u64, actual: u64 },

    #[error("inconsistent chunk for {correlation_id}: {reason}")]
    InconsistentChunk { correlation_id: String, reason: String },

    #[error("message {correlation_id} exceeds the limit of {max_bytes} bytes")]
    MessageTooLarge { correlation_id: String, max_bytes: usize },

    #[error("peer aborted {correlation_id}: {reason}")]
    Aborted { correlation_id: String, reason: String },

    #[error("too many in-flight reassemblies, the limit is {max_in_flight}")]
    TooManyInFlight { max_in_flight: usize },

    #[error("decompression failed: {source}")]
    Compression {
        #[from]
        source: io::Error,
    },

    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
}

impl ProtocolError {
    pub fn unknown_correlation<S: ToString>(correlation_id: S, sequence: u32) -> Self {
        Self::UnknownCorrelation { correlation_id: correlation_id.to_string(), sequence }
    }

    pub fn sequence_violation<S: ToString>(correlation_id: S, expected: u32, actual: u32) -> Self {
        Self::SequenceViolation { correlation_id: correlation_id.to_string(), expected, actual }
    }

    pub fn length_mismatch<S: ToString>(correlation_id: S, expected: u64, actual: u64) -> Self {
        Self::LengthMismatch { correlation_id: correlation_id.to_string(), expected, actual }
    }

    pub fn inconsistent_chunk<S: ToString, R: ToString>(correlation_id: S, reason: R) -> Self {
        Self::InconsistentChunk { correlation_id: correlation_id.to_string(), reason: reason.to_string() }
    }

    pub fn message_too_large<S: ToString>(correlation_id: S, max_bytes: usize) -> Self {
        Self::MessageTooLarge { correlation_id: correlation_id.to_string(), max_bytes }
    }

    pub fn aborted<S: ToString, R: ToString>(correlation_id: S, reason: R) -> Self {
        Self::Aborted { correlation_id: correlation_id.to_string(), reason: reason.to_string() }
    }

    pub fn malformed_frame<S: ToString>(str: S) -> Self {
        Self::MalformedFrame { reason: str.to_string() }
    }

    pub fn malformed_envelope<S: ToString>(str: S) -> Self {
        Self::MalformedEnvelope { reason: str.to_string() }
    }

    /// The correlation id this error is bound to, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::UnknownCorrelation { correlation_id, .. }
            | Self::SequenceViolation { correlation_id, .. }
            | Self::LengthMismatch { correlation_id, .. }
            | Self::InconsistentChunk { correlation_id, .. }
            | Self::MessageTooLarge { correlation_id, .. }
            | Self::Aborted { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }
}

/// Failures while producing a chunk sequence.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression failed: {source}")]
    Compression {
        #[from]
        source: io::Error,
    },

    #[error("envelope head could not be serialized: {reason}")]
    Serialize { reason: String },
}

impl CodecError {
    pub fn serialize<S: ToString>(str: S) -> Self {
        Self::Serialize { reason: str.to_string() }
    }
}
