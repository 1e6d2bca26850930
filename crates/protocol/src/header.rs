//! The fixed 12-byte frame header.
//!
//! ```text
//! byte 0      magic (0x08)
//! byte 1      version
//! byte 2      bit 7 message type, bit 6 heartbeat, bit 5 one-way,
//!             bits 4-2 compression type, bits 1-0 status
//! byte 3      serializer type
//! bytes 4-11  sequence number, big-endian
//! ```

use crate::compress::CompressType;
use crate::error::{ProtocolError, Result};
use crate::serialize::SerializeType;

/// Magic byte every frame starts with.
pub const MAGIC: u8 = 0x08;

/// Current protocol version.
pub const VERSION: u8 = 0;

/// Length of the fixed header in bytes.
pub const HEADER_LEN: usize = 12;

const TYPE_MASK: u8 = 0x80;
const HEARTBEAT_MASK: u8 = 0x40;
const ONEWAY_MASK: u8 = 0x20;
const COMPRESS_SHIFT: u8 = 2;
const COMPRESS_MASK: u8 = 0x1C;
const STATUS_MASK: u8 = 0x03;

/// Kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Sent by a client.
    Request = 0,
    /// Sent by a server in reply.
    Response = 1,
}

/// Outcome carried by a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageStatus {
    /// The call succeeded.
    Normal = 0,
    /// The call failed; the reason travels in metadata.
    Error = 1,
}

/// Fixed-size, bit-packed frame header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header([u8; HEADER_LEN]);

impl Header {
    /// A zeroed request header with the magic byte set.
    #[must_use]
    pub const fn new() -> Self {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = MAGIC;
        bytes[1] = VERSION;
        Self(bytes)
    }

    /// Wrap raw header bytes after checking the magic.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BadMagic`] if byte 0 is not [`MAGIC`].
    pub const fn from_bytes(bytes: [u8; HEADER_LEN]) -> Result<Self> {
        if bytes[0] != MAGIC {
            return Err(ProtocolError::BadMagic(bytes[0]));
        }
        Ok(Self(bytes))
    }

    /// Raw header bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.0
    }

    /// Reset every field except the magic byte.
    pub const fn clear(&mut self) {
        *self = Self::new();
    }

    /// Protocol version byte.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.0[1]
    }

    /// Set the protocol version byte.
    pub const fn set_version(&mut self, version: u8) {
        self.0[1] = version;
    }

    /// Request or response.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        if self.0[2] & TYPE_MASK == 0 {
            MessageType::Request
        } else {
            MessageType::Response
        }
    }

    /// Set the message kind.
    pub const fn set_message_type(&mut self, message_type: MessageType) {
        match message_type {
            MessageType::Request => self.0[2] &= !TYPE_MASK,
            MessageType::Response => self.0[2] |= TYPE_MASK,
        }
    }

    /// Whether this is a keep-alive frame.
    #[must_use]
    pub const fn is_heartbeat(&self) -> bool {
        self.0[2] & HEARTBEAT_MASK != 0
    }

    /// Mark or unmark as heartbeat.
    pub const fn set_heartbeat(&mut self, heartbeat: bool) {
        if heartbeat {
            self.0[2] |= HEARTBEAT_MASK;
        } else {
            self.0[2] &= !HEARTBEAT_MASK;
        }
    }

    /// Whether the sender expects no reply.
    #[must_use]
    pub const fn is_oneway(&self) -> bool {
        self.0[2] & ONEWAY_MASK != 0
    }

    /// Mark or unmark as one-way.
    pub const fn set_oneway(&mut self, oneway: bool) {
        if oneway {
            self.0[2] |= ONEWAY_MASK;
        } else {
            self.0[2] &= !ONEWAY_MASK;
        }
    }

    /// Raw 3-bit compression tag, which may name an unknown algorithm.
    #[must_use]
    pub const fn compress_tag(&self) -> u8 {
        (self.0[2] & COMPRESS_MASK) >> COMPRESS_SHIFT
    }

    /// Compression type, if the tag is one this build understands.
    #[must_use]
    pub fn compress_type(&self) -> Option<CompressType> {
        CompressType::try_from(self.compress_tag()).ok()
    }

    /// Set the compression type.
    pub const fn set_compress_type(&mut self, compress: CompressType) {
        self.set_compress_tag(compress as u8);
    }

    pub(crate) const fn set_compress_tag(&mut self, tag: u8) {
        self.0[2] = (self.0[2] & !COMPRESS_MASK) | ((tag << COMPRESS_SHIFT) & COMPRESS_MASK);
    }

    /// Normal or error status.
    #[must_use]
    pub const fn status(&self) -> MessageStatus {
        if self.0[2] & STATUS_MASK == 0 {
            MessageStatus::Normal
        } else {
            MessageStatus::Error
        }
    }

    /// Set the status bits.
    pub const fn set_status(&mut self, status: MessageStatus) {
        self.0[2] = (self.0[2] & !STATUS_MASK) | (status as u8);
    }

    /// Raw serializer tag.
    #[must_use]
    pub const fn serialize_tag(&self) -> u8 {
        self.0[3]
    }

    /// Serializer named by the tag.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedSerializer`] for unknown tags.
    pub fn serialize_type(&self) -> Result<SerializeType> {
        SerializeType::try_from(self.0[3])
    }

    /// Set the serializer tag.
    pub const fn set_serialize_type(&mut self, serialize: SerializeType) {
        self.0[3] = serialize as u8;
    }

    /// Correlation number matching responses to pending calls.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        u64::from_be_bytes([
            self.0[4], self.0[5], self.0[6], self.0[7], self.0[8], self.0[9], self.0[10],
            self.0[11],
        ])
    }

    /// Set the sequence number.
    pub const fn set_seq(&mut self, seq: u64) {
        let bytes = seq.to_be_bytes();
        let mut i = 0;
        while i < 8 {
            self.0[4 + i] = bytes[i];
            i += 1;
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("version", &self.version())
            .field("message_type", &self.message_type())
            .field("heartbeat", &self.is_heartbeat())
            .field("oneway", &self.is_oneway())
            .field("compress", &self.compress_tag())
            .field("status", &self.status())
            .field("serialize", &self.serialize_tag())
            .field("seq", &self.seq())
            .finish()
    }
}
