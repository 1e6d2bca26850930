//! Error types for the wire protocol.

use crate::header::Header;

use std::io;
use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding frames and payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The first byte of a frame was not the protocol magic.
    #[error("Bad magic byte {0:#04x}")]
    BadMagic(u8),

    /// Declared body length exceeds the configured maximum.
    #[error("Message body of {size} bytes exceeds maximum {max}")]
    MessageTooLarge {
        /// Declared body length.
        size: usize,
        /// Maximum allowed body length.
        max: usize,
    },

    /// A length-prefixed field ran past the end of the body.
    #[error("Truncated {0} field")]
    Truncated(&'static str),

    /// The metadata block holds an incomplete key/value pair.
    #[error("Metadata block is corrupt")]
    MetadataCorrupt,

    /// A string field was not valid UTF-8.
    #[error("Invalid UTF-8 in {0} field")]
    InvalidUtf8(&'static str),

    /// The compression bits name an algorithm this side cannot reverse.
    ///
    /// The body has been consumed, so the stream is still aligned and the
    /// carried header can be used to answer the frame.
    #[error("Unsupported compression type {tag}")]
    UnsupportedCompression {
        /// Raw 3-bit compression tag.
        tag: u8,
        /// Header of the rejected frame.
        header: Header,
    },

    /// A compressed payload could not be inflated.
    #[error("Failed to decompress payload: {reason}")]
    Decompression {
        /// Why the decoder gave up.
        reason: String,
        /// Header of the rejected frame.
        header: Header,
    },

    /// No serializer is available for the tag.
    #[error("Unsupported serializer type {0}")]
    UnsupportedSerializer(u8),

    /// Payload could not be serialized.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Payload could not be deserialized.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Header of the frame a non-fatal decode error belongs to.
    #[must_use]
    pub const fn frame_header(&self) -> Option<&Header> {
        match self {
            Self::UnsupportedCompression { header, .. } | Self::Decompression { header, .. } => {
                Some(header)
            }
            _ => None,
        }
    }

    /// Whether the connection carrying the frame must be closed.
    ///
    /// Everything except per-frame payload problems desynchronises or
    /// poisons the stream.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::UnsupportedCompression { .. }
                | Self::Decompression { .. }
                | Self::UnsupportedSerializer(_)
                | Self::SerializationFailed(_)
                | Self::DeserializationFailed(_)
        )
    }
}

impl From<ciborium::de::Error<io::Error>> for ProtocolError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for ProtocolError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}
