//! Payload compression.

use crate::pool::BufferPool;

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, Read, Write};

/// Payloads at or below this many bytes are sent uncompressed.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 1024;

/// Compression algorithm named by the 3-bit header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressType {
    /// Payload is sent as-is.
    #[default]
    None = 0,
    /// Gzip (deflate) compression.
    Gzip = 1,
}

impl TryFrom<u8> for CompressType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            other => Err(other),
        }
    }
}

impl CompressType {
    /// Compress `data`, staging the output in a pooled scratch buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder fails.
    pub fn compress(self, data: &[u8], pool: &BufferPool) -> io::Result<Bytes> {
        match self {
            Self::None => Ok(Bytes::copy_from_slice(data)),
            Self::Gzip => {
                let mut scratch = pool.acquire(data.len() / 2 + 64);
                scratch.clear();

                let mut encoder = GzEncoder::new(scratch, Compression::default());
                encoder.write_all(data)?;
                let scratch = encoder.finish()?;

                let out = Bytes::copy_from_slice(&scratch);
                pool.release(scratch);
                Ok(out)
            }
        }
    }

    /// Reverse [`CompressType::compress`], refusing output longer than
    /// `limit` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not a valid stream for this algorithm or
    /// expands past `limit`.
    pub fn decompress(self, data: &[u8], limit: Option<usize>, pool: &BufferPool) -> io::Result<Bytes> {
        match self {
            Self::None => Ok(Bytes::copy_from_slice(data)),
            Self::Gzip => {
                let hint = data.len().saturating_mul(2);
                let mut scratch = pool.acquire(limit.map_or(hint, |max| hint.min(max)));
                scratch.clear();

                let mut decoder = GzDecoder::new(data);
                match limit {
                    Some(max) => {
                        let cap = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
                        decoder.take(cap).read_to_end(&mut scratch)?;
                        if scratch.len() > max {
                            pool.release(scratch);
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("decompressed payload exceeds {max} bytes"),
                            ));
                        }
                    }
                    None => {
                        decoder.read_to_end(&mut scratch)?;
                    }
                }

                let out = Bytes::copy_from_slice(&scratch);
                pool.release(scratch);
                Ok(out)
            }
        }
    }
}
