//! Frame encoding and decoding.
//!
//! ```text
//! +----------+-------------+-----------------------------------------------+
//! | header   | body length | body                                          |
//! | 12 bytes | u32 BE      | path len | path | method len | method |       |
//! |          |             | metadata len | (klen k vlen v)* | payload     |
//! +----------+-------------+-----------------------------------------------+
//! ```

use crate::compress::{CompressType, DEFAULT_COMPRESS_THRESHOLD};
use crate::error::{ProtocolError, Result};
use crate::header::{HEADER_LEN, Header, MAGIC};
use crate::message::Message;
use crate::pool::{BufferPool, MessagePool};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Maximum body size (10MB by default).
pub const MAX_BODY_LEN: usize = 10 * 1024 * 1024;

/// Length of the header plus the body length field.
pub const PREAMBLE_LEN: usize = HEADER_LEN + 4;

/// Limits applied by [`FrameCodec`].
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Largest accepted body. Zero disables the check.
    pub max_body_len: usize,
    /// Payloads must be larger than this to be compressed.
    pub compress_threshold: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_body_len: MAX_BODY_LEN,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        }
    }
}

impl CodecConfig {
    /// Set the body size limit.
    #[must_use]
    pub const fn with_max_body_len(mut self, max_body_len: usize) -> Self {
        self.max_body_len = max_body_len;
        self
    }

    /// Set the compression threshold.
    #[must_use]
    pub const fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }
}

/// Codec turning byte streams into [`Message`]s and back.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    config: CodecConfig,
    buffers: BufferPool,
    messages: MessagePool,
}

impl FrameCodec {
    /// Create a codec sharing the given pools.
    #[must_use]
    pub const fn new(config: CodecConfig, buffers: BufferPool, messages: MessagePool) -> Self {
        Self {
            config,
            buffers,
            messages,
        }
    }

    /// The message pool decoded frames are drawn from.
    #[must_use]
    pub const fn messages(&self) -> &MessagePool {
        &self.messages
    }

    /// Encode a message into `dst`.
    ///
    /// A requested compression is skipped for payloads at or below the
    /// threshold, and dropped (flag cleared) if the compressor fails.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MessageTooLarge`] if the body would exceed
    /// the configured maximum or a length field.
    pub fn encode_message(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let mut header = message.header;
        let payload = self.outgoing_payload(message, &mut header);

        let metadata_len = message.metadata_len();
        let body_len = 12
            + message.service_path.len()
            + message.service_method.len()
            + metadata_len
            + payload.len();

        if self.config.max_body_len > 0 && body_len > self.config.max_body_len {
            return Err(ProtocolError::MessageTooLarge {
                size: body_len,
                max: self.config.max_body_len,
            });
        }
        let too_large = || ProtocolError::MessageTooLarge {
            size: body_len,
            max: u32::MAX as usize,
        };
        let body_len_u32 = u32::try_from(body_len).map_err(|_| too_large())?;

        dst.reserve(PREAMBLE_LEN + body_len);
        dst.put_slice(header.as_bytes());
        dst.put_u32(body_len_u32);

        #[allow(clippy::cast_possible_truncation)]
        {
            dst.put_u32(message.service_path.len() as u32);
            dst.put_slice(message.service_path.as_bytes());
            dst.put_u32(message.service_method.len() as u32);
            dst.put_slice(message.service_method.as_bytes());
            dst.put_u32(metadata_len as u32);
            for (key, value) in &message.metadata {
                dst.put_u32(key.len() as u32);
                dst.put_slice(key.as_bytes());
                dst.put_u32(value.len() as u32);
                dst.put_slice(value.as_bytes());
            }
        }
        dst.put_slice(&payload);

        Ok(())
    }

    fn outgoing_payload(&self, message: &Message, header: &mut Header) -> Bytes {
        let tag = header.compress_tag();
        if tag == 0 {
            return message.payload.clone();
        }

        let compress = match CompressType::try_from(tag) {
            Ok(compress) if message.payload.len() > self.config.compress_threshold => compress,
            Ok(_) => {
                header.set_compress_type(CompressType::None);
                return message.payload.clone();
            }
            Err(tag) => {
                warn!("Unknown compression type {tag}, sending payload uncompressed");
                header.set_compress_type(CompressType::None);
                return message.payload.clone();
            }
        };

        match compress.compress(&message.payload, &self.buffers) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!("Compression failed, sending payload uncompressed: {e}");
                header.set_compress_type(CompressType::None);
                message.payload.clone()
            }
        }
    }

    /// Decode one message from the front of `src`.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered. The magic byte is
    /// checked as soon as it arrives and the body length before the body is
    /// awaited.
    ///
    /// # Errors
    ///
    /// Fatal errors ([`ProtocolError::is_fatal`]) leave `src` in an undefined
    /// position. [`ProtocolError::UnsupportedCompression`] and
    /// [`ProtocolError::Decompression`] consume the frame.
    pub fn decode_message(&self, src: &mut BytesMut) -> Result<Option<Message>> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        if first != MAGIC {
            return Err(ProtocolError::BadMagic(first));
        }

        if src.len() < PREAMBLE_LEN {
            src.reserve(PREAMBLE_LEN - src.len());
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([src[12], src[13], src[14], src[15]]) as usize;
        if self.config.max_body_len > 0 && body_len > self.config.max_body_len {
            return Err(ProtocolError::MessageTooLarge {
                size: body_len,
                max: self.config.max_body_len,
            });
        }

        let frame_len = PREAMBLE_LEN + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&src[..HEADER_LEN]);
        let header = Header::from_bytes(header_bytes)?;

        src.advance(PREAMBLE_LEN);
        let body = src.split_to(body_len).freeze();

        let mut message = self.messages.get();
        message.header = header;
        if let Err(e) = parse_body(body, &mut message) {
            self.messages.put(message);
            return Err(e);
        }

        let tag = header.compress_tag();
        if tag != 0 {
            let Ok(compress) = CompressType::try_from(tag) else {
                self.messages.put(message);
                return Err(ProtocolError::UnsupportedCompression { tag, header });
            };
            let limit = (self.config.max_body_len > 0).then_some(self.config.max_body_len);
            match compress.decompress(&message.payload, limit, &self.buffers) {
                Ok(payload) => message.payload = payload,
                Err(e) => {
                    self.messages.put(message);
                    return Err(ProtocolError::Decompression {
                        reason: e.to_string(),
                        header,
                    });
                }
            }
        }

        Ok(Some(message))
    }

    /// Encode a message into a fresh buffer.
    ///
    /// # Errors
    ///
    /// See [`FrameCodec::encode_message`].
    pub fn encode_to_bytes(&self, message: &Message) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.encode_message(message, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode a complete frame held in `data`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Truncated`] if `data` holds less than one
    /// frame, or any error of [`FrameCodec::decode_message`].
    pub fn decode_from_slice(&self, data: &[u8]) -> Result<Message> {
        let mut src = BytesMut::from(data);
        self.decode_message(&mut src)?
            .ok_or(ProtocolError::Truncated("frame"))
    }
}

fn read_len(body: &mut Bytes, field: &'static str) -> Result<usize> {
    if body.remaining() < 4 {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(body.get_u32() as usize)
}

fn read_str<'a>(body: &'a [u8], field: &'static str) -> Result<&'a str> {
    std::str::from_utf8(body).map_err(|_| ProtocolError::InvalidUtf8(field))
}

fn read_field(body: &mut Bytes, field: &'static str) -> Result<Bytes> {
    let len = read_len(body, field)?;
    if body.remaining() < len {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(body.split_to(len))
}

fn parse_body(mut body: Bytes, message: &mut Message) -> Result<()> {
    let path = read_field(&mut body, "service path")?;
    message.service_path.push_str(read_str(&path, "service path")?);

    let method = read_field(&mut body, "service method")?;
    message
        .service_method
        .push_str(read_str(&method, "service method")?);

    let mut metadata = read_field(&mut body, "metadata")?;
    while metadata.has_remaining() {
        let key = read_field(&mut metadata, "metadata key")
            .map_err(|_| ProtocolError::MetadataCorrupt)?;
        let value = read_field(&mut metadata, "metadata value")
            .map_err(|_| ProtocolError::MetadataCorrupt)?;
        message.metadata.insert(
            read_str(&key, "metadata key")?.to_owned(),
            read_str(&value, "metadata value")?.to_owned(),
        );
    }

    message.payload = body;
    Ok(())
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        self.decode_message(src)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let result = self.encode_message(&message, dst);
        self.messages.put(message);
        result
    }
}

/// Decoder that hands per-frame errors out as items.
///
/// `FramedRead` ends the stream after the first decoder error. Errors that
/// leave the stream aligned (see [`ProtocolError::is_fatal`]) are yielded as
/// `Ok(Some(Err(_)))` instead so the reader can answer them and go on.
#[derive(Debug, Clone, Default)]
pub struct TolerantCodec {
    inner: FrameCodec,
}

impl TolerantCodec {
    /// Wrap a frame codec.
    #[must_use]
    pub const fn new(inner: FrameCodec) -> Self {
        Self { inner }
    }
}

impl Decoder for TolerantCodec {
    type Item = Result<Message>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Result<Message>>> {
        match self.inner.decode_message(src) {
            Ok(message) => Ok(message.map(Ok)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Ok(Some(Err(e))),
        }
    }
}
