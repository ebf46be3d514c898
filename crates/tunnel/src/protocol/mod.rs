//! Core tunnel protocol types.
//!
//! - **Chunks** ([`ChunkedMessage`]): one bounded fragment of a larger payload
//! - **Frames** ([`Frame`]): what actually travels in a single transport message
//! - **Envelopes** ([`RequestEnvelope`], [`ResponseEnvelope`]): the http request or response carried by a chunk run
//! - **Errors** ([`ProtocolError`], [`CodecError`]): failures of one logical message
//!
//! Data flows one way per direction: an http message is turned into an envelope, the envelope into
//! chunks, each chunk into a frame. The receiver walks the same path backwards.

mod chunk;
pub use chunk::ChunkedMessage;

mod frame;
pub use frame::Frame;

mod envelope;
pub use envelope::API_VERSION_HEADER;
pub use envelope::Envelope;
pub use envelope::JsonSerializer;
pub use envelope::RequestEnvelope;
pub use envelope::RequestHead;
pub use envelope::ResponseEnvelope;
pub use envelope::ResponseHead;
pub use envelope::Serializer;

mod error;
pub use error::CodecError;
pub use error::ProtocolError;
