//! Whole-payload compression applied before chunking.
//!
//! Compression runs once over the full payload and decompression only after full reassembly, so a
//! single chunk is never meaningful on its own.

use bytes::{Bytes, BytesMut};
use flate2::Compression as Level;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use serde::Deserialize;
use std::io;
use std::io::{Read, Write};
use tracing::trace;
use zstd::stream::read::Decoder as ZstdDecoder;
use zstd::stream::write::Encoder as ZstdEncoder;

/// Supported payload compressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Deflate,
    Zstd,
    Br,
}

impl Compression {
    /// Returns the name of the encoding.
    pub fn name(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Deflate => "deflate",
            Compression::Zstd => "zstd",
            Compression::Br => "br",
        }
    }

    /// Wire code of an optional compression, 0 means raw.
    pub fn code(compression: Option<Self>) -> u8 {
        match compression {
            None => 0,
            Some(Compression::Gzip) => 1,
            Some(Compression::Deflate) => 2,
            Some(Compression::Zstd) => 3,
            Some(Compression::Br) => 4,
        }
    }

    /// Inverse of [`Compression::code`], `Err` for unknown codes.
    pub fn from_code(code: u8) -> Result<Option<Self>, u8> {
        match code {
            0 => Ok(None),
            1 => Ok(Some(Compression::Gzip)),
            2 => Ok(Some(Compression::Deflate)),
            3 => Ok(Some(Compression::Zstd)),
            4 => Ok(Some(Compression::Br)),
            unknown => Err(unknown),
        }
    }

    pub fn compress(self, data: &[u8]) -> io::Result<Bytes> {
        let mut encoder = Encoder::new(self)?;
        encoder.write(data)?;
        let bytes = encoder.finish()?;
        trace!(encoding = self.name(), raw = data.len(), compressed = bytes.len(), "compressed payload");
        Ok(bytes)
    }

    /// Decompresses at most `limit` bytes; output longer than `limit` is truncated to `limit + 1`
    /// so the caller can detect the overflow without inflating a hostile payload.
    pub fn decompress(self, data: &[u8], limit: u64) -> io::Result<Bytes> {
        let mut out = Vec::new();
        let cap = limit.saturating_add(1);
        match self {
            Compression::Gzip => GzDecoder::new(data).take(cap).read_to_end(&mut out)?,
            Compression::Deflate => ZlibDecoder::new(data).take(cap).read_to_end(&mut out)?,
            Compression::Zstd => ZstdDecoder::new(data)?.take(cap).read_to_end(&mut out)?,
            Compression::Br => brotli::Decompressor::new(data, 4096).take(cap).read_to_end(&mut out)?,
        };
        Ok(Bytes::from(out))
    }
}

// inspired by from actix-http
struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4096) }
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Encoder {
    Gzip(GzEncoder<Writer>),
    Deflate(ZlibEncoder<Writer>),
    Zstd(ZstdEncoder<'static, Writer>),
    Br(Box<brotli::CompressorWriter<Writer>>),
}

impl Encoder {
    fn new(compression: Compression) -> io::Result<Self> {
        let encoder = match compression {
            Compression::Gzip => Self::Gzip(GzEncoder::new(Writer::new(), Level::default())),
            Compression::Deflate => Self::Deflate(ZlibEncoder::new(Writer::new(), Level::default())),
            Compression::Zstd => Self::Zstd(ZstdEncoder::new(Writer::new(), 3)?),
            Compression::Br => Self::Br(Box::new(brotli::CompressorWriter::new(
                Writer::new(),
                32 * 1024, // 32 KiB buffer
                5,         // BROTLI_PARAM_QUALITY
                22,        // BROTLI_PARAM_LGWIN
            ))),
        };
        Ok(encoder)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Gzip(encoder) => encoder.write_all(data),
            Self::Deflate(encoder) => encoder.write_all(data),
            Self::Zstd(encoder) => encoder.write_all(data),
            Self::Br(encoder) => encoder.write_all(data),
        }
    }

    fn finish(self) -> io::Result<Bytes> {
        match self {
            Self::Gzip(encoder) => Ok(encoder.finish()?.buf.freeze()),
            Self::Deflate(encoder) => Ok(encoder.finish()?.buf.freeze()),
            Self::Zstd(encoder) => Ok(encoder.finish()?.buf.freeze()),
            Self::Br(mut encoder) => {
                encoder.flush()?;
                Ok(encoder.into_inner().buf.freeze())
            }
        }
    }
}
