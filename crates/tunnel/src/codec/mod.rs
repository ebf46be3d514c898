//! Chunk codec for payloads that exceed one transport message.
//!
//! # Architecture
//!
//! - Sender side:
//!   - [`ChunkEncoder`]: compresses the whole payload once, then splits it into bounded [`ChunkedMessage`]s
//!
//! - Receiver side:
//!   - [`ReassemblyBuffer`]: joins the chunks of one correlation id, strictly in sequence order
//!   - [`Reassembler`]: all in-flight buffers of an endpoint, with bounds and idle eviction
//!
//! - Wire:
//!   - [`FrameCodec`]: a `tokio_util` codec turning [`Frame`]s into transport messages and back
//!
//! [`ChunkedMessage`]: crate::protocol::ChunkedMessage
//! [`Frame`]: crate::protocol::Frame

mod chunk_encoder;
mod compression;
mod frame_codec;
mod reassembly;

pub use chunk_encoder::ChunkEncoder;
pub use chunk_encoder::DEFAULT_COMPRESS_THRESHOLD;
pub use compression::Compression;
pub use frame_codec::FrameCodec;
pub use frame_codec::MAX_CORRELATION_ID_LEN;
pub use frame_codec::chunk_frame_overhead;
pub use reassembly::Progress;
pub use reassembly::ReassemblyBuffer;
pub use reassembly::ReassemblyLimits;
pub use reassembly::Reassembler;
