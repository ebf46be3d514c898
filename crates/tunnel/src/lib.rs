//! Core of an HTTP tunnel over a size limited message transport.
//!
//! HTTP requests and responses are turned into envelopes, split into bounded chunks and carried as
//! individual transport messages, then joined back together on the other side. Replies are matched to
//! requests through correlation ids, so many calls can share one asynchronous, multiplexed transport.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use micro_tunnel::codec::{ChunkEncoder, Compression, Reassembler};
//!
//! let payload = Bytes::from(vec![7u8; 200_000]);
//! let encoder = ChunkEncoder::new(64 * 1024, Some(Compression::Gzip));
//! let chunks = encoder.encode("call-1", payload.clone()).unwrap();
//!
//! let reassembler = Reassembler::default();
//! let mut joined = None;
//! for chunk in chunks {
//!     joined = reassembler.feed(chunk).unwrap();
//! }
//! assert_eq!(joined, Some(payload));
//! ```
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`protocol`]: chunks, frames, envelopes and their errors
//! - [`codec`]: compression, chunking, reassembly and the frame wire codec
//! - [`correlation`]: pending calls keyed by correlation id, with deadlines
//! - [`transport`]: the message transport contract and an in-memory implementation
//! - [`handler`]: the HTTP handler contract both tunnel ends plug into
//! - [`sweep`]: the background task expiring pending calls and stale buffers
//! - [`config`]: tunables shared by both tunnel ends
//!
//! # Error Handling
//!
//! - [`protocol::ProtocolError`]: a malformed or out-of-order chunk stream, fatal to one message only
//! - [`protocol::CodecError`]: the sending side could not produce a chunk stream
//! - [`correlation::CallFault`]: a pending call timed out, was cancelled or saw a broken reply
//! - [`transport::TransportError`]: the peer could not be reached at all
//!
//! # Limitations
//!
//! - A single message is fully buffered on both sides, there is no streaming body
//! - Chunks of one correlation id must arrive in order, only duplicates are tolerated

pub mod codec;
pub mod config;
pub mod correlation;
pub mod handler;
pub mod protocol;
pub mod sweep;
pub mod transport;

mod utils;
pub(crate) use utils::ensure;
