//! Binary wire format of [`Frame`].
//!
//! All integers are big-endian:
//!
//! ```text
//! u8 version | u8 kind | u16 id length | id bytes | kind specific part
//!
//! chunk: u8 flags | u8 compression | u32 sequence | u64 total length | u32 payload length | payload
//! ack:   u32 sequence
//! next:  u32 sequence
//! abort: u16 reason length | reason bytes
//! ```

use crate::codec::Compression;
use crate::ensure;
use crate::protocol::{ChunkedMessage, Frame, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const FRAME_VERSION: u8 = 1;

const KIND_CHUNK: u8 = 1;
const KIND_ACK: u8 = 2;
const KIND_NEXT: u8 = 3;
const KIND_ABORT: u8 = 4;

const FLAG_LAST: u8 = 0b0000_0001;

const PREFIX_SIZE: usize = 4;
const CHUNK_HEADER_SIZE: usize = 18;

/// Largest correlation id the wire format carries.
pub const MAX_CORRELATION_ID_LEN: usize = u16::MAX as usize;

/// Bytes a chunk frame adds on top of its payload, for a correlation id of `id_len` bytes.
pub const fn chunk_frame_overhead(id_len: usize) -> usize {
    PREFIX_SIZE + id_len + CHUNK_HEADER_SIZE
}

/// Largest chunk payload a stream decoder accepts unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Encodes and decodes [`Frame`]s, one frame per transport message.
///
/// Chunk frames announcing a payload above `max_payload` are rejected before any of it is buffered.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encodes a single frame into a fresh buffer.
    pub fn encode_frame(frame: &Frame) -> Result<Bytes, ProtocolError> {
        let mut dst = BytesMut::new();
        Encoder::<&Frame>::encode(&mut FrameCodec::new(), frame, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Decodes a transport message that must hold exactly one frame.
    ///
    /// A frame claiming more bytes than the message holds fails at once.
    pub fn decode_frame(message: &[u8]) -> Result<Frame, ProtocolError> {
        let mut src = BytesMut::from(message);
        let frame = FrameCodec::with_max_payload(message.len())
            .decode(&mut src)?
            .ok_or_else(|| ProtocolError::malformed_frame("truncated frame"))?;
        ensure!(src.is_empty(), ProtocolError::malformed_frame(format!("{} trailing bytes", src.len())));
        Ok(frame)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let id = frame.correlation_id().as_bytes();
        let id_len = u16::try_from(id.len()).map_err(|e| ProtocolError::malformed_frame(format!("correlation id too long: {e}")))?;

        let kind = match frame {
            Frame::Chunk(_) => KIND_CHUNK,
            Frame::Ack { .. } => KIND_ACK,
            Frame::Next { .. } => KIND_NEXT,
            Frame::Abort { .. } => KIND_ABORT,
        };

        dst.reserve(PREFIX_SIZE + id.len() + CHUNK_HEADER_SIZE);
        dst.put_u8(FRAME_VERSION);
        dst.put_u8(kind);
        dst.put_u16(id_len);
        dst.put_slice(id);

        match frame {
            Frame::Chunk(chunk) => {
                let payload_len = u32::try_from(chunk.payload.len())
                    .map_err(|e| ProtocolError::malformed_frame(format!("chunk payload too long: {e}")))?;
                dst.reserve(CHUNK_HEADER_SIZE + chunk.payload.len());
                dst.put_u8(if chunk.is_last { FLAG_LAST } else { 0 });
                dst.put_u8(Compression::code(chunk.compression));
                dst.put_u32(chunk.sequence_number);
                dst.put_u64(chunk.total_length);
                dst.put_u32(payload_len);
                dst.put_slice(&chunk.payload);
            }
            Frame::Ack { sequence_number, .. } | Frame::Next { sequence_number, .. } => {
                dst.put_u32(*sequence_number);
            }
            Frame::Abort { reason, .. } => {
                // reasons are diagnostics only, cut them to what the length prefix can carry
                let reason = &reason.as_bytes()[..reason.len().min(u16::MAX as usize)];
                dst.put_u16(u16::try_from(reason.len()).unwrap_or(u16::MAX));
                dst.put_slice(reason);
            }
        }
        Ok(())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Frame>::encode(self, &frame, dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    /// Returns `Ok(None)` until a whole frame is buffered; nothing is consumed in that case.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PREFIX_SIZE {
            return Ok(None);
        }

        let version = src[0];
        ensure!(version == FRAME_VERSION, ProtocolError::malformed_frame(format!("unsupported version {version}")));
        let kind = src[1];
        let id_len = usize::from(u16::from_be_bytes([src[2], src[3]]));

        let Some(frame_len) = frame_length(kind, id_len, &src[..], self.max_payload)? else {
            return Ok(None);
        };
        if src.len() < frame_len {
            return Ok(None);
        }

        let mut buf = src.split_to(frame_len).freeze();
        buf.advance(PREFIX_SIZE);
        let id_bytes = buf.split_to(id_len);
        let correlation_id =
            String::from_utf8(id_bytes.to_vec()).map_err(ProtocolError::malformed_frame)?;

        let frame = match kind {
            KIND_CHUNK => {
                let flags = buf.get_u8();
                let compression = Compression::from_code(buf.get_u8())
                    .map_err(|code| ProtocolError::malformed_frame(format!("unknown compression {code}")))?;
                let sequence_number = buf.get_u32();
                let total_length = buf.get_u64();
                let _payload_len = buf.get_u32();
                Frame::Chunk(ChunkedMessage {
                    correlation_id,
                    sequence_number,
                    is_last: flags & FLAG_LAST != 0,
                    payload: buf,
                    total_length,
                    compression,
                })
            }
            KIND_ACK => Frame::Ack { correlation_id, sequence_number: buf.get_u32() },
            KIND_NEXT => Frame::Next { correlation_id, sequence_number: buf.get_u32() },
            KIND_ABORT => {
                buf.advance(2);
                Frame::Abort { correlation_id, reason: String::from_utf8_lossy(&buf).into_owned() }
            }
            unknown => return Err(ProtocolError::malformed_frame(format!("unknown frame kind {unknown}"))),
        };
        Ok(Some(frame))
    }
}

/// Full length of the frame starting at `src`, `None` if not enough bytes are buffered to tell.
fn frame_length(kind: u8, id_len: usize, src: &[u8], max_payload: usize) -> Result<Option<usize>, ProtocolError> {
    let body_start = PREFIX_SIZE + id_len;
    let len = match kind {
        KIND_CHUNK => {
            let header_end = body_start + CHUNK_HEADER_SIZE;
            if src.len() < header_end {
                return Ok(None);
            }
            let len_at = header_end - 4;
            let payload_len = u32::from_be_bytes([src[len_at], src[len_at + 1], src[len_at + 2], src[len_at + 3]]) as usize;
            ensure!(
                payload_len <= max_payload,
                ProtocolError::malformed_frame(format!("chunk payload of {payload_len} bytes exceeds {max_payload}"))
            );
            header_end + payload_len
        }
        KIND_ACK | KIND_NEXT => body_start + 4,
        KIND_ABORT => {
            if src.len() < body_start + 2 {
                return Ok(None);
            }
            body_start + 2 + usize::from(u16::from_be_bytes([src[body_start], src[body_start + 1]]))
        }
        unknown => return Err(ProtocolError::malformed_frame(format!("unknown frame kind {unknown}"))),
    };
    Ok(Some(len))
}
